//! The metadata schema stored on the dag.
//!
//! A pushed repository is a UnixFS directory (the working tree of the last
//! pushed branch) with one extra link, `.git`, pointing at a [`Vfs`] node.
//! The VFS carries the ref hierarchy, whose leaves link to [`CommitNode`]s
//! and [`TagNode`]s; commits link to their tree twice — once as the UnixFS
//! directory and once as a mode mapping, since UnixFS has no notion of Git
//! file modes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// CID of the canonical empty UnixFS directory; the base every working
/// tree is built from.
pub const EMPTY_DIR_CID: &str = "QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn";

/// A link to another dag node, rendered as `{"/": "<cid>"}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    #[serde(rename = "/")]
    pub target: String,
}

impl Link {
    pub fn new(cid: impl Into<String>) -> Self {
        Self { target: cid.into() }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.target)
    }
}

/// The CID a value links to, if it is a link.
pub fn as_link(value: &Value) -> Option<&str> {
    value.as_object()?.get("/")?.as_str()
}

/// An author, committer or tagger signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigNode {
    pub name: String,
    pub email: String,
    /// Seconds since the epoch.
    pub time: i64,
    /// Timezone offset in minutes, signed.
    pub offset: i32,
}

impl SigNode {
    pub fn from_git(sig: &git2::Signature) -> Self {
        Self {
            name: String::from_utf8_lossy(sig.name_bytes()).into_owned(),
            email: String::from_utf8_lossy(sig.email_bytes()).into_owned(),
            time: sig.when().seconds(),
            offset: sig.when().offset_minutes(),
        }
    }

    pub fn to_git(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::new(
            &self.name,
            &self.email,
            &git2::Time::new(self.time, self.offset),
        )
    }
}

/// A commit, with enough of the original to reconstruct its exact OID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitNode {
    /// Original Git OID, hex.
    pub oid: String,
    #[serde(rename = "authorSig")]
    pub author: SigNode,
    #[serde(rename = "committerSig")]
    pub committer: SigNode,
    /// Message encoding header, when the commit carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub message: String,
    /// UnixFS directory of the commit's tree.
    pub tree: Link,
    /// Mode mapping of the commit's tree.
    pub modes: Link,
    /// Parent commit nodes, first parent first.
    pub parents: Vec<Link>,
    /// Detached `gpgsig` header, when the commit is signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Annotated,
    Lightweight,
}

/// A tag. Lightweight tags are just a named pointer at a commit; annotated
/// tags are objects of their own, optionally PGP-signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagNode {
    /// OID of the tag object, or of the commit for lightweight tags.
    pub oid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TagKind,
    pub commit: Link,
    #[serde(rename = "taggerSig", default, skip_serializing_if = "Option::is_none")]
    pub tagger: Option<SigNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The `.git` node at the remote root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vfs {
    /// Repository name, from an `ipfs://<name>` url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stable identity of the remote, minted on first push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Ref path of the default branch, e.g. `refs/heads/master`.
    #[serde(rename = "HEAD", default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    /// Nested `heads/…` and `tags/…` mappings whose leaves link to commit
    /// or tag nodes.
    #[serde(default)]
    pub refs: Map<String, Value>,
}

impl Vfs {
    /// A fresh VFS for a named remote.
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_owned()),
            ..Self::default()
        }
    }

    /// Record `cid` under a ref path such as `refs/heads/master`, creating
    /// intermediate mappings on demand. Returns `false` if the path is not
    /// under `refs/`.
    pub fn insert_ref(&mut self, path: &str, cid: &str) -> bool {
        let mut parts = path.split('/');
        if parts.next() != Some("refs") {
            return false;
        }
        let parts: Vec<&str> = parts.collect();
        let Some((leaf, dirs)) = parts.split_last() else {
            return false;
        };
        if leaf.is_empty() || dirs.iter().any(|d| d.is_empty()) {
            return false;
        }

        let mut node = &mut self.refs;
        for dir in dirs {
            let entry = node
                .entry(dir.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(child) = entry else {
                return false;
            };
            node = child;
        }
        node.insert(leaf.to_string(), serde_json::json!({ "/": cid }));

        true
    }

    /// CID recorded under a ref path, if any.
    pub fn lookup_ref(&self, path: &str) -> Option<&str> {
        let mut parts = path.split('/');
        if parts.next() != Some("refs") {
            return None;
        }
        let parts: Vec<&str> = parts.collect();
        let (leaf, dirs) = parts.split_last()?;

        let mut node = &self.refs;
        for dir in dirs {
            node = node.get(*dir)?.as_object()?;
        }
        as_link(node.get(*leaf)?)
    }

    /// All recorded refs as `(refpath, cid)`, in key order.
    pub fn leaves(&self) -> Vec<(String, String)> {
        fn walk(prefix: &str, map: &Map<String, Value>, out: &mut Vec<(String, String)>) {
            for (name, value) in map {
                let path = format!("{prefix}/{name}");
                if let Some(cid) = as_link(value) {
                    out.push((path, cid.to_owned()));
                } else if let Some(child) = value.as_object() {
                    walk(&path, child, out);
                }
            }
        }

        let mut out = Vec::new();
        walk("refs", &self.refs, &mut out);
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_link_wire_form() {
        let link = Link::new("QmExample");
        assert_eq!(serde_json::to_value(&link).unwrap(), json!({"/": "QmExample"}));

        let back: Link = serde_json::from_value(json!({"/": "QmExample"})).unwrap();
        assert_eq!(back, link);
        assert_eq!(as_link(&json!({"/": "QmExample"})), Some("QmExample"));
        assert_eq!(as_link(&json!(42)), None);
    }

    #[test]
    fn test_sig_node_round_trip() {
        let sig =
            git2::Signature::new("anonymous", "anonymous@example.com", &git2::Time::new(1514817556, 120))
                .unwrap();
        let node = SigNode::from_git(&sig);
        assert_eq!(node.name, "anonymous");
        assert_eq!(node.time, 1514817556);
        assert_eq!(node.offset, 120);

        let back = node.to_git().unwrap();
        assert_eq!(back.when().seconds(), 1514817556);
        assert_eq!(back.when().offset_minutes(), 120);
    }

    #[test]
    fn test_commit_node_field_names() {
        let node = CommitNode {
            oid: "0123456789abcdef0123456789abcdef01234567".to_owned(),
            author: SigNode {
                name: "a".into(),
                email: "a@example.com".into(),
                time: 0,
                offset: 0,
            },
            committer: SigNode {
                name: "c".into(),
                email: "c@example.com".into(),
                time: 0,
                offset: 0,
            },
            encoding: None,
            message: "hello\n".into(),
            tree: Link::new("QmTree"),
            modes: Link::new("bafyModes"),
            parents: vec![Link::new("bafyParent")],
            signature: None,
        };
        let value = serde_json::to_value(&node).unwrap();

        assert!(value.get("authorSig").is_some());
        assert!(value.get("committerSig").is_some());
        assert_eq!(value.get("tree"), Some(&json!({"/": "QmTree"})));
        // Optional fields are omitted, not null.
        assert!(value.get("encoding").is_none());
        assert!(value.get("signature").is_none());
    }

    #[test]
    fn test_tag_kind_wire_form() {
        assert_eq!(
            serde_json::to_value(TagKind::Annotated).unwrap(),
            json!("annotated")
        );
        assert_eq!(
            serde_json::to_value(TagKind::Lightweight).unwrap(),
            json!("lightweight")
        );
    }

    #[test]
    fn test_vfs_head_wire_name() {
        let vfs = Vfs {
            head: Some("refs/heads/master".into()),
            ..Vfs::default()
        };
        let value = serde_json::to_value(&vfs).unwrap();
        assert_eq!(value.get("HEAD"), Some(&json!("refs/heads/master")));
    }

    #[test]
    fn test_vfs_insert_and_lookup() {
        let mut vfs = Vfs::named("acme");
        assert!(vfs.insert_ref("refs/heads/master", "bafyCommit"));
        assert!(vfs.insert_ref("refs/tags/v1", "bafyTag"));
        assert!(!vfs.insert_ref("HEAD", "bafyCommit"));
        assert!(!vfs.insert_ref("refs/", "bafyCommit"));

        assert_eq!(vfs.lookup_ref("refs/heads/master"), Some("bafyCommit"));
        assert_eq!(vfs.lookup_ref("refs/tags/v1"), Some("bafyTag"));
        assert_eq!(vfs.lookup_ref("refs/heads/dev"), None);

        assert_eq!(
            vfs.leaves(),
            vec![
                ("refs/heads/master".to_owned(), "bafyCommit".to_owned()),
                ("refs/tags/v1".to_owned(), "bafyTag".to_owned()),
            ]
        );
    }

    #[test]
    fn test_vfs_continuation_preserves_existing_refs() {
        let loaded = json!({
            "name": "acme",
            "uuid": "00000000-0000-1000-8000-000000000000",
            "HEAD": "refs/heads/master",
            "refs": {"heads": {"master": {"/": "bafyOld"}}},
        });
        let mut vfs: Vfs = serde_json::from_value(loaded).unwrap();

        vfs.insert_ref("refs/heads/dev", "bafyNew");
        assert_eq!(vfs.lookup_ref("refs/heads/master"), Some("bafyOld"));
        assert_eq!(vfs.lookup_ref("refs/heads/dev"), Some("bafyNew"));
        assert_eq!(
            vfs.uuid.as_deref(),
            Some("00000000-0000-1000-8000-000000000000")
        );
    }
}
