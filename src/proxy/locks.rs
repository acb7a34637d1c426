use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Serializes reconciliation rounds touching the same application or domain.
#[derive(Default)]
pub struct ProxyRoundLocks {
    locks: Arc<LockMap>,
}

/// Held for the duration of a round. Releases every key on drop.
pub struct RoundGuard {
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl RoundGuard {
    #[cfg(test)]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        self.guards.clear();
        // An entry nobody else holds or waits on is only referenced by the map.
        for key in &self.keys {
            self.locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

impl ProxyRoundLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn application_key(app_id: &str) -> String {
        format!("app:{app_id}")
    }

    pub fn domain_key(domain: &str) -> String {
        format!("domain:{domain}")
    }

    /// Held while a deployment is promoted and its service updated. Kept
    /// apart from the application key so the replica resync that follows
    /// can still take that one.
    pub fn deployment_key(app_id: &str) -> String {
        format!("deploy:{app_id}")
    }

    /// Locks every key. Keys are taken in sorted order so two rounds with
    /// overlapping key sets cannot deadlock.
    pub async fn acquire(&self, keys: impl IntoIterator<Item = String>) -> RoundGuard {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        RoundGuard {
            keys,
            guards,
            locks: Arc::clone(&self.locks),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}
