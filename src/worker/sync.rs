//! Periodic re-application of everything the store records as live on the
//! proxies, for nodes that restarted or joined with an empty configuration.

use super::{WorkerContext, WorkerError, ingress, redirect, ssl};
use crate::model::{RuleStatus, TlsStatus};

#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct SyncReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record(&mut self, what: &str, id: &str, outcome: Result<bool, WorkerError>) {
        match outcome {
            Ok(true) => self.applied += 1,
            Ok(false) => self.skipped += 1,
            Err(e) => {
                log::warn!("Resyncing {what} {id} failed: {e}");
                self.failed += 1;
            }
        }
    }
}

/// A failing item does not stop the sweep, the next run retries it.
pub(super) async fn sync_proxy_state(ctx: &WorkerContext) -> Result<SyncReport, WorkerError> {
    let mut report = SyncReport::default();

    for domain in ctx.store.list_domains().await? {
        if domain.tls_status != TlsStatus::Issued || domain.full_chain.is_empty() {
            continue;
        }
        let outcome = ssl::publish(ctx, &domain).await.map(|()| true);
        report.record("certificate", &domain.name, outcome);
    }
    for rule in ctx.store.list_ingress_rules().await? {
        if rule.status == RuleStatus::Applied {
            let outcome = ingress::reapply(ctx, &rule).await;
            report.record("ingress rule", &rule.id, outcome);
        }
    }
    for rule in ctx.store.list_redirect_rules().await? {
        if rule.status == RuleStatus::Applied {
            let outcome = redirect::reapply(ctx, &rule).await;
            report.record("redirect rule", &rule.id, outcome);
        }
    }

    log::info!(
        "Proxy state resynced: {} applied, {} skipped, {} failed",
        report.applied,
        report.skipped,
        report.failed
    );
    Ok(report)
}
