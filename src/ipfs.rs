//! Client for the subset of the Kubo HTTP RPC the helper needs.
//!
//! Metadata nodes are stored as dag-cbor but travel as dag-json, so values
//! are plain [`serde_json::Value`] trees in which links appear as
//! `{"/": "<cid>"}` maps. CIDs are opaque strings end to end.
//!
//! Every operation is a single attempt; there are no retries at this
//! layer.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Default address of the local IPFS node's RPC endpoint.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5001";

#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure, including an unreachable node.
    #[error("ipfs: {0}")]
    Transport(#[from] reqwest::Error),
    /// The node answered with an RPC error.
    #[error("ipfs: {0}")]
    Api(String),
    /// The node answered with something we can't read.
    #[error("ipfs: malformed response: {0}")]
    Malformed(String),
}

/// What a UnixFS directory entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// One entry of a UnixFS directory listing.
#[derive(Debug, Clone)]
pub struct LsEntry {
    pub name: String,
    pub cid: String,
    pub kind: EntryKind,
}

#[derive(Deserialize)]
struct CidRef {
    #[serde(rename = "/")]
    cid: String,
}

#[derive(Deserialize)]
struct DagPutResponse {
    #[serde(rename = "Cid")]
    cid: CidRef,
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct PatchResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct LsResponse {
    #[serde(rename = "Objects")]
    objects: Vec<LsObject>,
}

#[derive(Deserialize)]
struct LsObject {
    #[serde(rename = "Links")]
    links: Vec<LsLink>,
}

#[derive(Deserialize)]
struct LsLink {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Type")]
    kind: i64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Message")]
    message: String,
}

/// Handle on an IPFS node's HTTP RPC.
#[derive(Clone)]
pub struct IpfsClient {
    http: reqwest::Client,
    base: String,
}

impl IpfsClient {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_owned();

        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    /// Read the dag node at `path` (a CID, optionally followed by a path
    /// within the dag, e.g. `<cid>/.git`).
    pub async fn dag_get(&self, path: &str) -> Result<Value, Error> {
        let resp = self
            .rpc("dag/get", &[("arg", path), ("output-codec", "dag-json")])
            .await?;

        json_body(resp).await
    }

    /// Store a metadata node as dag-cbor; returns its CID.
    pub async fn dag_put(&self, node: &Value, pin: bool) -> Result<String, Error> {
        let data = serde_json::to_vec(node).map_err(|e| Error::Malformed(e.to_string()))?;
        let resp = self
            .rpc_with_body(
                "dag/put",
                &[
                    ("store-codec", "dag-cbor"),
                    ("input-codec", "dag-json"),
                    ("pin", bool_str(pin)),
                ],
                data,
            )
            .await?;
        let put: DagPutResponse = json_body(resp).await?;

        Ok(put.cid.cid)
    }

    /// List the entries of the UnixFS directory at `cid`.
    pub async fn ls(&self, cid: &str) -> Result<Vec<LsEntry>, Error> {
        let resp = self.rpc("ls", &[("arg", cid)]).await?;
        let listing: LsResponse = json_body(resp).await?;
        let object = listing
            .objects
            .into_iter()
            .next()
            .ok_or_else(|| Error::Malformed(format!("empty listing for {cid}")))?;

        Ok(object
            .links
            .into_iter()
            .map(|link| LsEntry {
                name: link.name,
                cid: link.hash,
                kind: if link.kind == 1 {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
            })
            .collect())
    }

    /// Stream the file at `path` fully into memory.
    pub async fn cat(&self, path: &str) -> Result<Vec<u8>, Error> {
        let resp = self.rpc("cat", &[("arg", path)]).await?;

        Ok(resp.bytes().await?.to_vec())
    }

    /// Add raw bytes as a UnixFS file; returns its CID.
    pub async fn add(&self, data: Vec<u8>, pin: bool) -> Result<String, Error> {
        let resp = self
            .rpc_with_body("add", &[("pin", bool_str(pin))], data)
            .await?;
        let added: AddResponse = json_body(resp).await?;

        Ok(added.hash)
    }

    /// Return a new directory equal to `base` plus a link `name` → `target`.
    pub async fn patch_link(
        &self,
        base: &str,
        name: &str,
        target: &str,
        create: bool,
    ) -> Result<String, Error> {
        let resp = self
            .rpc(
                "object/patch/add-link",
                &[
                    ("arg", base),
                    ("arg", name),
                    ("arg", target),
                    ("create", bool_str(create)),
                ],
            )
            .await?;
        let patched: PatchResponse = json_body(resp).await?;

        Ok(patched.hash)
    }

    /// Recursively pin `cid`.
    pub async fn pin_add(&self, cid: &str) -> Result<(), Error> {
        self.rpc("pin/add", &[("arg", cid)]).await?;

        Ok(())
    }

    async fn rpc(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, Error> {
        let resp = self
            .http
            .post(format!("{}/api/v0/{path}", self.base))
            .query(query)
            .send()
            .await?;

        check(resp).await
    }

    async fn rpc_with_body(
        &self,
        path: &str,
        query: &[(&str, &str)],
        data: Vec<u8>,
    ) -> Result<reqwest::Response, Error> {
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(data));
        let resp = self
            .http
            .post(format!("{}/api/v0/{path}", self.base))
            .query(query)
            .multipart(form)
            .send()
            .await?;

        check(resp).await
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();

    match resp.json::<ErrorResponse>().await {
        Ok(e) => Err(Error::Api(e.message)),
        Err(_) => Err(Error::Api(format!("unexpected status {status}"))),
    }
}

async fn json_body<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let bytes = resp.bytes().await?;

    serde_json::from_slice(&bytes).map_err(|e| Error::Malformed(e.to_string()))
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}
