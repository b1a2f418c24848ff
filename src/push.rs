//! Push-side translation: Git objects into their hybrid IPFS
//! representation.
//!
//! Blobs become UnixFS files; trees become UnixFS directories paired with
//! a mode-mapping node; commits and tags become metadata nodes linking it
//! all together. Translations are deduplicated through the cache and
//! coalesced through the push-side registry, so each object is pushed at
//! most once per batch no matter how many paths reach it.

use std::rc::Rc;
use std::str::FromStr;

use futures::future;
use futures::future::{FutureExt, LocalBoxFuture};
use thiserror::Error;
use uuid::Uuid;

use crate::cache;
use crate::dag::{self, CommitNode, Link, SigNode, TagKind, TagNode, Vfs};
use crate::ipfs;
use crate::resolver;
use crate::{is_not_found, Context};

/// First line of a detached PGP block inside a tag message.
const PGP_SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";

#[derive(Debug, Error)]
pub enum Error {
    /// Refspec could not be parsed.
    #[error("invalid refspec `{0}`")]
    InvalidRefspec(String),
    /// Destination is not under `refs/`.
    #[error("invalid destination ref `{0}`")]
    InvalidRef(String),
    /// The remote is append-only; refs cannot be deleted.
    #[error("deletion is not supported by ipfs remotes")]
    DeleteUnsupported,
    /// A pushed tree has no recorded filesystem CID.
    #[error("no filesystem CID recorded for tree {0}")]
    MissingTree(git2::Oid),
    /// Metadata could not be encoded.
    #[error("encoding metadata: {0}")]
    Encode(#[from] serde_json::Error),
    /// Git error.
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    /// IPFS error.
    #[error(transparent)]
    Ipfs(#[from] ipfs::Error),
    /// Cache error.
    #[error(transparent)]
    Cache(#[from] cache::Error),
    /// A coalesced translation failed or was cancelled.
    #[error(transparent)]
    Resolve(#[from] resolver::Error),
}

/// Push command, parsed from a Git refspec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Update ref.
    Push { src: String, dst: String, force: bool },
    /// Delete ref.
    Delete { dst: String },
}

impl Command {
    /// Return the destination refname.
    pub fn dst(&self) -> &str {
        match self {
            Self::Push { dst, .. } => dst,
            Self::Delete { dst } => dst,
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((src, dst)) = s.split_once(':') else {
            return Err(Error::InvalidRefspec(s.to_owned()));
        };
        if dst.is_empty() {
            return Err(Error::InvalidRefspec(s.to_owned()));
        }
        let dst = dst.to_owned();

        if src.is_empty() {
            Ok(Self::Delete { dst })
        } else {
            let (src, force) = match src.strip_prefix('+') {
                Some(stripped) => (stripped, true),
                None => (src, false),
            };

            Ok(Self::Push {
                src: src.to_owned(),
                dst,
                force,
            })
        }
    }
}

/// Run a push batch: translate each ref, then assemble and pin the new
/// remote root. Returns the root CID if at least one ref was pushed.
///
/// Per-ref failures are reported (`error <dst> …`) without aborting the
/// rest of the batch.
pub(crate) async fn run(
    ctx: &Rc<Context>,
    vfs: &mut Vfs,
    commands: &[Command],
) -> Result<Option<String>, Error> {
    vfs.head = None;
    let mut base: Option<String> = None;

    for cmd in commands {
        let result = match cmd {
            Command::Delete { .. } => Err(Error::DeleteUnsupported),
            // Nb. the force flag is irrelevant here: the remote has no
            // compare-and-swap, so every push wins.
            Command::Push { src, dst, .. } => push_ref(ctx, src, dst).await,
        };
        match result {
            Ok((top, tree)) => {
                println!("ok {}", cmd.dst());
                if !vfs.insert_ref(cmd.dst(), &top) {
                    log::warn!(target: "push", "could not record `{}` in the ref tree", cmd.dst());
                }
                if vfs.head.is_none() {
                    vfs.head = Some(cmd.dst().to_owned());
                    base = Some(tree);
                }
            }
            Err(e) => {
                log::error!(target: "push", "failed to push {}: {e}", cmd.dst());
                println!("error {} {e}", cmd.dst());
            }
        }
    }

    let Some(base) = base else {
        return Ok(None);
    };
    if vfs.uuid.is_none() {
        vfs.uuid = Some(mint_uuid());
    }

    let node = serde_json::to_value(&*vfs)?;
    let vfs_cid = ctx.ipfs.dag_put(&node, true).await?;
    let root = ctx.ipfs.patch_link(&base, ".git", &vfs_cid, true).await?;
    ctx.ipfs.pin_add(&root).await?;

    log::debug!(target: "push", "new root {root}");

    Ok(Some(root))
}

/// Push a single ref. Returns the CID of the pushed commit or tag node,
/// and the CID of the corresponding working tree.
async fn push_ref(ctx: &Rc<Context>, src: &str, dst: &str) -> Result<(String, String), Error> {
    if !dst.starts_with("refs/") {
        return Err(Error::InvalidRef(dst.to_owned()));
    }
    // It's ok for the source to be a raw OID, eg. when pushing a detached
    // commit.
    let oid = match ctx.repo.refname_to_id(src) {
        Ok(oid) => oid,
        Err(e) => match git2::Oid::from_str(src) {
            Ok(oid) => oid,
            Err(_) => return Err(e.into()),
        },
    };

    if let Some(name) = dst.strip_prefix("refs/tags/") {
        let (cid, target) = push_tag(ctx, name, oid).await?;
        Ok((cid, tree_cid(ctx, target)?))
    } else {
        let cid = resolve_push(ctx, oid).wait().await?;
        Ok((cid, tree_cid(ctx, oid)?))
    }
}

/// The UnixFS directory pushed for a commit's tree. Always present in the
/// cache once the commit itself has been pushed.
fn tree_cid(ctx: &Context, commit: git2::Oid) -> Result<String, Error> {
    let tree = ctx.repo.find_commit(commit)?.tree_id();

    ctx.cache.cid_for(&tree)?.ok_or(Error::MissingTree(tree))
}

/// Resolve a commit OID to the CID of its pushed node, coalescing with any
/// translation already in flight.
pub(crate) fn resolve_push(ctx: &Rc<Context>, oid: git2::Oid) -> resolver::Flight<String> {
    let (flight, leader) = ctx.push_flights.join(oid);
    if leader {
        let ctx = ctx.clone();
        tokio::task::spawn_local(async move {
            let result = push_commit(&ctx, oid).await;
            ctx.push_flights
                .complete(&oid, result.map_err(|e| e.to_string()));
        });
    }
    flight
}

/// Translate one commit into its metadata node.
async fn push_commit(ctx: &Rc<Context>, oid: git2::Oid) -> Result<String, Error> {
    if let Some(cid) = ctx.cache.cid_for(&oid)? {
        return Ok(cid);
    }
    let commit = ctx.repo.find_commit(oid)?;
    let (fs_cid, modes_cid) = push_tree(ctx, commit.tree()?).await?;

    // Parents fan out through the registry; the vector preserves Git's
    // parent order regardless of completion order.
    let flights: Vec<_> = commit.parent_ids().map(|p| resolve_push(ctx, p)).collect();
    let mut parents = Vec::with_capacity(flights.len());
    for flight in flights {
        parents.push(Link::new(flight.wait().await?));
    }

    let signature = match ctx.repo.extract_signature(&oid, None) {
        Ok((sig, _)) => Some(String::from_utf8_lossy(&sig).into_owned()),
        Err(e) if is_not_found(&e) => None,
        Err(e) => return Err(e.into()),
    };

    let node = CommitNode {
        oid: oid.to_string(),
        author: SigNode::from_git(&commit.author()),
        committer: SigNode::from_git(&commit.committer()),
        encoding: commit.message_encoding().map(|e| e.to_owned()),
        message: String::from_utf8_lossy(commit.message_raw_bytes()).into_owned(),
        tree: Link::new(fs_cid),
        modes: Link::new(modes_cid),
        parents,
        signature,
    };
    let cid = ctx.ipfs.dag_put(&serde_json::to_value(&node)?, true).await?;
    ctx.cache.set_cid(&oid, &cid)?;

    log::debug!(target: "push", "commit {oid} -> {cid}");

    Ok(cid)
}

struct TreeEntry {
    name: String,
    oid: git2::Oid,
    filemode: i32,
    kind: Option<git2::ObjectType>,
}

/// Translate one tree into a UnixFS directory plus its mode mapping.
///
/// Entries are translated concurrently, then linked into the directory in
/// tree order, starting from the canonical empty directory.
fn push_tree<'a>(
    ctx: &'a Rc<Context>,
    tree: git2::Tree<'a>,
) -> LocalBoxFuture<'a, Result<(String, String), Error>> {
    async move {
        let oid = tree.id();
        if let (Some(fs), Some(modes)) = (ctx.cache.cid_for(&oid)?, ctx.cache.modes_for(&oid)?) {
            return Ok((fs, modes));
        }

        let entries: Vec<TreeEntry> = tree
            .iter()
            .map(|e| TreeEntry {
                name: String::from_utf8_lossy(e.name_bytes()).into_owned(),
                oid: e.id(),
                filemode: e.filemode(),
                kind: e.kind(),
            })
            .collect();
        let translated =
            future::try_join_all(entries.iter().map(|entry| push_entry(ctx, entry))).await?;

        let mut base = dag::EMPTY_DIR_CID.to_owned();
        let mut modes = serde_json::Map::new();
        for (entry, translated) in entries.iter().zip(translated) {
            let Some((cid, mode)) = translated else {
                continue;
            };
            base = ctx.ipfs.patch_link(&base, &entry.name, &cid, false).await?;
            modes.insert(entry.name.clone(), mode);
        }

        let modes_cid = ctx
            .ipfs
            .dag_put(&serde_json::Value::Object(modes), true)
            .await?;
        ctx.cache.set_cid(&oid, &base)?;
        ctx.cache.set_modes(&oid, &modes_cid)?;

        Ok((base, modes_cid))
    }
    .boxed_local()
}

/// Translate one tree entry. Returns the CID to link under the entry's
/// name and the value to record in the mode mapping, or `None` for
/// entries that have no representation on the remote.
async fn push_entry(
    ctx: &Rc<Context>,
    entry: &TreeEntry,
) -> Result<Option<(String, serde_json::Value)>, Error> {
    match entry.kind {
        Some(git2::ObjectType::Tree) => {
            let subtree = ctx.repo.find_tree(entry.oid)?;
            let (fs, modes) = push_tree(ctx, subtree).await?;

            Ok(Some((fs, serde_json::json!({ "/": modes }))))
        }
        Some(git2::ObjectType::Blob) => {
            let cid = match ctx.cache.cid_for(&entry.oid)? {
                Some(cid) => cid,
                None => {
                    let blob = ctx.repo.find_blob(entry.oid)?;
                    let cid = ctx.ipfs.add(blob.content().to_vec(), true).await?;
                    ctx.cache.set_cid(&entry.oid, &cid)?;
                    cid
                }
            };

            Ok(Some((cid, serde_json::Value::from(entry.filemode))))
        }
        _ => {
            // Gitlinks (submodules) and the like.
            log::warn!(
                target: "push",
                "skipping unrepresentable tree entry `{}` (mode {:o})",
                entry.name,
                entry.filemode
            );

            Ok(None)
        }
    }
}

/// Translate one tag ref. Returns the CID of the tag node and the OID of
/// the commit it points at.
async fn push_tag(
    ctx: &Rc<Context>,
    name: &str,
    oid: git2::Oid,
) -> Result<(String, git2::Oid), Error> {
    let (node, target) = match ctx.repo.find_tag(oid) {
        Ok(tag) => {
            let target = tag.target_id();
            let commit = resolve_push(ctx, target).wait().await?;
            let raw = String::from_utf8_lossy(tag.message_bytes().unwrap_or_default()).into_owned();
            let (message, signature) = split_tag_message(&raw);

            (
                TagNode {
                    oid: oid.to_string(),
                    name: name.to_owned(),
                    kind: TagKind::Annotated,
                    commit: Link::new(commit),
                    tagger: tag.tagger().as_ref().map(SigNode::from_git),
                    message: Some(message),
                    signature,
                },
                target,
            )
        }
        // A lightweight tag is just a commit with a name.
        Err(e) if is_not_found(&e) => {
            let commit = resolve_push(ctx, oid).wait().await?;

            (
                TagNode {
                    oid: oid.to_string(),
                    name: name.to_owned(),
                    kind: TagKind::Lightweight,
                    commit: Link::new(commit),
                    tagger: None,
                    message: None,
                    signature: None,
                },
                oid,
            )
        }
        Err(e) => return Err(e.into()),
    };

    let cid = ctx.ipfs.dag_put(&serde_json::to_value(&node)?, true).await?;
    // Nb. a lightweight tag's OID is the commit's, which already maps to
    // the commit node; only tag objects proper get a cache entry.
    if node.kind == TagKind::Annotated {
        ctx.cache.set_cid(&oid, &cid)?;
    }

    Ok((cid, target))
}

/// Split a tag message from its trailing PGP block, if any. The block
/// starts at the first line equal to the PGP header.
fn split_tag_message(raw: &str) -> (String, Option<String>) {
    match raw.find(PGP_SIGNATURE_BEGIN) {
        Some(pos) if pos == 0 || raw.as_bytes()[pos - 1] == b'\n' => {
            (raw[..pos].to_owned(), Some(raw[pos..].to_owned()))
        }
        _ => (raw.to_owned(), None),
    }
}

fn mint_uuid() -> String {
    let mut node = [0u8; 6];
    let mut rng = fastrand::Rng::new();
    rng.fill(&mut node);

    Uuid::now_v1(&node).to_string()
}
