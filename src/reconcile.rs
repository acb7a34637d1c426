//! Scheduled resync of the proxy nodes with the stored rules and certificates.

use std::sync::Arc;
use std::time::Duration;

use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::queue::{QueueError, Task, TaskQueue};
use crate::renewal::CronWatcher;

const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Queues a proxy state sync at every occurrence of its schedule.
pub struct ProxySync {
    queue: Arc<dyn TaskQueue>,
}

impl ProxySync {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    pub async fn trigger(&self) -> Result<(), QueueError> {
        self.queue.enqueue(Task::SyncProxyState).await
    }

    pub async fn run(self, schedule: Schedule, shutdown: CancellationToken) {
        let watcher = CronWatcher::new(&schedule);
        log::info!("Proxy state sync scheduled by {schedule}");
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if !watcher.is_ready() {
                        continue;
                    }
                    if let Err(e) = self.trigger().await {
                        log::error!("Queueing proxy state sync failed: {e}");
                    }
                }
            }
        }
        log::info!("Proxy state sync stopped");
    }
}
