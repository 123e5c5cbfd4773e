//! Per-identity serialization of build-and-apply

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per daemon identity. Different identities never wait on
/// each other.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    /// Create an empty lock map
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `namespace/name`
    pub async fn lock(&self, namespace: &str, name: &str) -> OwnedMutexGuard<()> {
        let key = format!("{}/{}", namespace, name);
        // Clone the Arc out so the map shard is not held across the await
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Number of identities seen so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True before any identity was locked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
