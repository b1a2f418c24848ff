//! Single-flight registries for in-flight translations.
//!
//! Merge commits reach the same ancestor through multiple paths; without
//! coalescing, the same subtree would be translated once per path,
//! multiplying I/O and racing on the cache. A [`Registry`] guarantees that
//! at most one translation per key is running, and fans the result out to
//! every caller that joined while it ran.
//!
//! Everything here assumes a single-threaded executor: registries live in
//! a `RefCell` and waiters are completed under the same borrow that
//! removes them, so a late joiner can never miss a result.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum Error {
    /// The translation this flight was waiting on failed.
    #[error("{0}")]
    Failed(String),
    /// The translation was cancelled before completing.
    #[error("translation cancelled")]
    Cancelled,
}

/// A completion handle for one translation. Await it with [`Flight::wait`].
pub struct Flight<V> {
    rx: oneshot::Receiver<Result<V, String>>,
}

impl<V> Flight<V> {
    /// A handle that is already complete. Used when the answer is known
    /// synchronously (e.g. a cache hit) so callers see a uniform interface.
    pub fn ready(value: V) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(value));

        Self { rx }
    }

    /// Wait for the translation to complete.
    pub async fn wait(self) -> Result<V, Error> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Failed(e)),
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// Registry of in-flight translations, keyed by OID on the push side and
/// by CID on the fetch side.
pub struct Registry<K, V> {
    flights: RefCell<HashMap<K, Vec<oneshot::Sender<Result<V, String>>>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Registry<K, V> {
    pub fn new() -> Self {
        Self {
            flights: RefCell::new(HashMap::new()),
        }
    }

    /// Join the flight for `key`. The boolean is `true` for the first
    /// caller, which is expected to start the underlying translation and
    /// eventually call [`Registry::complete`].
    pub fn join(&self, key: K) -> (Flight<V>, bool) {
        let mut flights = self.flights.borrow_mut();
        let (tx, rx) = oneshot::channel();

        match flights.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(tx);
                (Flight { rx }, false)
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![tx]);
                (Flight { rx }, true)
            }
        }
    }

    /// Complete the flight for `key`, waking every waiter with the result.
    pub fn complete(&self, key: &K, result: Result<V, String>) {
        let waiters = self.flights.borrow_mut().remove(key).unwrap_or_default();
        for tx in waiters {
            // A waiter may have been dropped; that's fine.
            let _ = tx.send(result.clone());
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_coalesces() {
        let registry: Registry<u32, String> = Registry::new();

        let (first, lead1) = registry.join(1);
        let (second, lead2) = registry.join(1);
        assert!(lead1);
        assert!(!lead2);

        // A distinct key gets its own flight.
        let (_, lead3) = registry.join(2);
        assert!(lead3);

        registry.complete(&1, Ok("cid".to_owned()));
        assert_eq!(first.wait().await.unwrap(), "cid");
        assert_eq!(second.wait().await.unwrap(), "cid");
    }

    #[tokio::test]
    async fn test_failure_fans_out() {
        let registry: Registry<u32, String> = Registry::new();

        let (first, _) = registry.join(1);
        let (second, _) = registry.join(1);

        registry.complete(&1, Err("boom".to_owned()));
        assert!(matches!(first.wait().await, Err(Error::Failed(e)) if e == "boom"));
        assert!(matches!(second.wait().await, Err(Error::Failed(e)) if e == "boom"));
    }

    #[tokio::test]
    async fn test_key_is_reusable_after_completion() {
        let registry: Registry<u32, String> = Registry::new();

        let (flight, lead) = registry.join(1);
        assert!(lead);
        registry.complete(&1, Ok("a".to_owned()));
        flight.wait().await.unwrap();

        let (_, lead) = registry.join(1);
        assert!(lead);
    }

    #[tokio::test]
    async fn test_ready() {
        let flight = Flight::ready(42);
        assert_eq!(flight.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_dropped_registry_cancels_waiters() {
        let registry: Registry<u32, String> = Registry::new();
        let (flight, _) = registry.join(1);

        drop(registry);
        assert!(matches!(flight.wait().await, Err(Error::Cancelled)));
    }
}
