use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Maps running deployment ids to the token of the handler working on them.
#[derive(Default)]
pub struct CancellationRegistry {
    active: DashMap<String, (u64, CancellationToken)>,
    generation: AtomicU64,
}

/// Keeps a registration alive. Dropping it unregisters the deployment.
pub struct CancellationGuard<'a> {
    registry: &'a CancellationRegistry,
    deployment_id: String,
    generation: u64,
    token: CancellationToken,
}

impl CancellationGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CancellationGuard<'_> {
    fn drop(&mut self) {
        // A redelivered task may have registered the same id again.
        self.registry
            .active
            .remove_if(&self.deployment_id, |_, (generation, _)| {
                *generation == self.generation
            });
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a deployment, deriving its token from `parent` so that a
    /// process shutdown cancels it as well.
    pub fn register(
        &self,
        deployment_id: &str,
        parent: &CancellationToken,
    ) -> CancellationGuard<'_> {
        let token = parent.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        log::debug!("Registering cancellation for deployment {deployment_id}");
        self.active
            .insert(deployment_id.to_string(), (generation, token.clone()));
        CancellationGuard {
            registry: self,
            deployment_id: deployment_id.to_string(),
            generation,
            token,
        }
    }

    /// Requests cooperative cancellation. Returns false when nothing with
    /// that id is running.
    pub fn cancel(&self, deployment_id: &str) -> bool {
        if let Some((_, (_, token))) = self.active.remove(deployment_id) {
            log::info!("Cancelling deployment {deployment_id}");
            token.cancel();
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub fn is_registered(&self, deployment_id: &str) -> bool {
        self.active.contains_key(deployment_id)
    }
}
