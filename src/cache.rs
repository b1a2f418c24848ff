//! Durable cache of translations between Git object ids and IPFS content
//! ids.
//!
//! Three key families share the store: `<oid>` maps a Git object to the CID
//! it was pushed as, `modes:<oid>` maps a tree to the CID of its mode
//! mapping, and `<cid>` maps a content id back to the Git object it was
//! fetched as. Entries are only ever added; overwriting a key with a
//! different value indicates corruption and is rejected.

use std::path::Path;

use thiserror::Error;

/// Prefix of the key family holding tree-mode CIDs.
const MODES_PREFIX: &str = "modes:";

#[derive(Debug, Error)]
pub enum Error {
    /// Backing store error.
    #[error("cache: {0}")]
    Store(#[from] sled::Error),
    /// A stored value could not be decoded.
    #[error("cache: value under key `{0}` could not be decoded")]
    Encoding(String),
    /// A `put` would overwrite an existing key with a different value.
    #[error("cache: refusing to overwrite `{key}` with a different value")]
    Inconsistent { key: String },
}

/// An on-disk key-value store, usually living next to the Git object
/// database (`$GIT_DIR/remote-ipfs`).
#[derive(Clone)]
pub struct Cache {
    db: sled::Db,
}

impl Cache {
    /// Open or create a cache at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Open an in-memory cache that is discarded on drop.
    pub fn temporary() -> Result<Self, Error> {
        Ok(Self {
            db: sled::Config::default().temporary(true).open()?,
        })
    }

    /// Look up a raw key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    /// Insert a raw entry. Re-inserting the same value is a no-op;
    /// inserting a different value under an existing key is an error.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if let Some(existing) = self.db.get(key)? {
            if existing == value {
                return Ok(());
            }
            return Err(Error::Inconsistent {
                key: String::from_utf8_lossy(key).into_owned(),
            });
        }
        self.db.insert(key, value)?;
        self.db.flush()?;

        Ok(())
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<(), Error> {
        self.db.clear()?;
        self.db.flush()?;

        Ok(())
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), Error>> + '_ {
        self.db
            .iter()
            .map(|kv| kv.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Error::from))
    }

    /// CID a Git object was pushed as, if any.
    pub fn cid_for(&self, oid: &git2::Oid) -> Result<Option<String>, Error> {
        self.get_str(oid.to_string().as_bytes())
    }

    /// Record the CID a Git object was pushed as.
    pub fn set_cid(&self, oid: &git2::Oid, cid: &str) -> Result<(), Error> {
        self.put(oid.to_string().as_bytes(), cid.as_bytes())
    }

    /// CID of the mode mapping pushed for a tree, if any.
    pub fn modes_for(&self, oid: &git2::Oid) -> Result<Option<String>, Error> {
        self.get_str(format!("{MODES_PREFIX}{oid}").as_bytes())
    }

    /// Record the CID of the mode mapping pushed for a tree.
    pub fn set_modes(&self, oid: &git2::Oid, cid: &str) -> Result<(), Error> {
        self.put(format!("{MODES_PREFIX}{oid}").as_bytes(), cid.as_bytes())
    }

    /// Git object a CID was fetched as, if any.
    pub fn oid_for(&self, cid: &str) -> Result<Option<git2::Oid>, Error> {
        match self.get_str(cid.as_bytes())? {
            Some(hex) => git2::Oid::from_str(&hex)
                .map(Some)
                .map_err(|_| Error::Encoding(cid.to_owned())),
            None => Ok(None),
        }
    }

    /// Record the Git object a CID was fetched as.
    pub fn set_oid(&self, cid: &str, oid: &git2::Oid) -> Result<(), Error> {
        self.put(cid.as_bytes(), oid.to_string().as_bytes())
    }

    fn get_str(&self, key: &[u8]) -> Result<Option<String>, Error> {
        match self.db.get(key)? {
            Some(value) => String::from_utf8(value.to_vec())
                .map(Some)
                .map_err(|_| Error::Encoding(String::from_utf8_lossy(key).into_owned())),
            None => Ok(None),
        }
    }
}
