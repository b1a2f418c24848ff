//! Ref listing for `git ls-remote`, fetch and push negotiation.

use std::rc::Rc;

use futures::future;
use serde_json::Value;
use thiserror::Error;

use crate::dag::Vfs;
use crate::ipfs;
use crate::Context;

#[derive(Debug, Error)]
pub enum Error {
    /// A ref points at a node that has no `oid` field.
    #[error("node {0} carries no `oid`")]
    MissingOid(String),
    /// IPFS error.
    #[error(transparent)]
    Ipfs(#[from] ipfs::Error),
}

/// Resolve every ref recorded in the VFS to a `(oid, refpath)` pair, the
/// shape Git expects from a `list` answer.
pub(crate) async fn refs(ctx: &Rc<Context>, vfs: &Vfs) -> Result<Vec<(String, String)>, Error> {
    future::try_join_all(vfs.leaves().into_iter().map(|(path, cid)| async move {
        let node = ctx.ipfs.dag_get(&cid).await?;
        let oid = node
            .get("oid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MissingOid(cid.clone()))?
            .to_owned();

        Ok((oid, path))
    }))
    .await
}
