//! Scheduled certificate renewal.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::model::TlsStatus;
use crate::queue::{SslGenerateRequest, Task, TaskQueue};
use crate::store::EntityStore;
use crate::worker::WorkerError;

const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct CronWatcher {
    schedule: Schedule,
    next: AtomicI64,
}

const NONE_TIMESTAMP: i64 = i64::MIN;

impl CronWatcher {
    pub fn new(schedule: &Schedule) -> Self {
        let schedule = schedule.clone();
        let next = Self::upcoming(&schedule);
        Self {
            schedule,
            next: AtomicI64::new(next),
        }
    }

    fn upcoming(schedule: &Schedule) -> i64 {
        schedule
            .upcoming(Utc)
            .next()
            .map(|d| d.timestamp())
            .unwrap_or(NONE_TIMESTAMP)
    }

    /// True once per scheduled occurrence that has passed.
    pub fn is_ready(&self) -> bool {
        let current = self.next.load(Ordering::SeqCst);
        if current == NONE_TIMESTAMP {
            return false;
        }
        match DateTime::from_timestamp(current, 0) {
            Some(next) if Utc::now() >= next => {
                let new_next = Self::upcoming(&self.schedule);
                // Only succeed if no other caller beat us to it
                self.next
                    .compare_exchange(current, new_next, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            }
            _ => false,
        }
    }
}

/// Queues issuance for auto-renew domains whose certificate is close to
/// expiring.
pub struct RenewalScan {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn TaskQueue>,
    renew_before_days: i64,
}

impl RenewalScan {
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn TaskQueue>,
        renew_before_days: i64,
    ) -> Self {
        Self {
            store,
            queue,
            renew_before_days,
        }
    }

    /// Runs one scan. Returns how many domains were queued.
    pub async fn scan(&self) -> Result<usize, WorkerError> {
        let now = Utc::now();
        let due: Vec<_> = self
            .store
            .list_domains()
            .await?
            .into_iter()
            .filter(|domain| {
                domain.auto_renew
                    && domain.tls_status == TlsStatus::Issued
                    && !domain.is_ip_address()
                    && domain.expires_within(self.renew_before_days, now)
            })
            .collect();
        for domain in &due {
            log::info!(
                "Certificate of {} expires {}, queueing renewal",
                domain.name,
                domain
                    .expires_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            self.queue
                .enqueue(Task::SslGenerate(SslGenerateRequest {
                    domain_id: domain.id.clone(),
                }))
                .await?;
        }
        Ok(due.len())
    }

    /// Scans at every occurrence of `schedule` until `shutdown` fires.
    pub async fn run(self, schedule: Schedule, shutdown: CancellationToken) {
        let watcher = CronWatcher::new(&schedule);
        log::info!("Certificate renewal scheduled by {schedule}");
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if !watcher.is_ready() {
                        continue;
                    }
                    match self.scan().await {
                        Ok(0) => log::debug!("No certificates due for renewal"),
                        Ok(count) => log::info!("Queued {count} certificate renewal(s)"),
                        Err(e) => log::error!("Renewal scan failed: {e}"),
                    }
                }
            }
        }
        log::info!("Certificate renewal stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Domain;
    use crate::store::MemoryStore;
    use crate::testing::RecordingQueue;
    use std::str::FromStr;

    fn make_schedule(expr: &str) -> Schedule {
        Schedule::from_str(expr).expect("Failed to parse cron expression")
    }

    fn domain(id: &str, name: &str, status: TlsStatus, expires_in_days: i64) -> Domain {
        Domain {
            id: id.into(),
            name: name.into(),
            tls_status: status,
            private_key: String::new(),
            full_chain: String::new(),
            issued_at: None,
            expires_at: Some(Utc::now() + chrono::Duration::days(expires_in_days)),
            issuer: String::new(),
            auto_renew: true,
        }
    }

    #[test]
    fn test_is_ready_returns_false_when_not_yet_time() {
        let watcher = CronWatcher::new(&make_schedule("0 0 0 1 1 * 2099"));
        assert!(!watcher.is_ready());
    }

    #[test]
    fn test_is_ready_fires_once_per_occurrence() {
        let watcher = CronWatcher::new(&make_schedule("0 0 * * * *"));
        let past = Utc::now().timestamp() - 10;
        watcher.next.store(past, Ordering::SeqCst);

        assert!(watcher.is_ready());
        assert!(watcher.next.load(Ordering::SeqCst) > past);
        assert!(!watcher.is_ready());
    }

    #[test]
    fn test_is_ready_returns_false_when_next_is_none() {
        let watcher = CronWatcher::new(&make_schedule("* * * * * *"));
        watcher.next.store(NONE_TIMESTAMP, Ordering::SeqCst);
        assert!(!watcher.is_ready());
    }

    #[tokio::test]
    async fn test_scan_queues_expiring_domains() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingQueue::default());
        store
            .insert_domain(domain("d1", "soon.example.com", TlsStatus::Issued, 5))
            .await
            .unwrap();
        store
            .insert_domain(domain("d2", "later.example.com", TlsStatus::Issued, 60))
            .await
            .unwrap();
        store
            .insert_domain(domain("d3", "broken.example.com", TlsStatus::Failed, 5))
            .await
            .unwrap();
        let mut manual = domain("d4", "manual.example.com", TlsStatus::Issued, 5);
        manual.auto_renew = false;
        store.insert_domain(manual).await.unwrap();
        store
            .insert_domain(domain("d5", "10.0.0.9", TlsStatus::Issued, 5))
            .await
            .unwrap();

        let scan = RenewalScan::new(store, queue.clone(), 15);
        assert_eq!(scan.scan().await.unwrap(), 1);
        assert_eq!(
            queue.tasks(),
            vec![Task::SslGenerate(SslGenerateRequest {
                domain_id: "d1".into()
            })]
        );
    }
}
