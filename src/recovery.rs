//! Re-queues work for every entity left mid-flight, after a restart or on
//! SIGHUP. Handlers are idempotent, so queueing something already in flight
//! only costs a status check.

use crate::model::{DeploymentStatus, RuleStatus, TlsStatus};
use crate::queue::{
    BuildApplicationRequest, DeployApplicationRequest, RuleRequest, SslGenerateRequest, Task,
    TaskQueue,
};
use crate::store::EntityStore;
use crate::worker::WorkerError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    pub builds: usize,
    pub deploys: usize,
    pub rule_applies: usize,
    pub rule_deletes: usize,
    pub certificates: usize,
}

impl RecoverySummary {
    pub fn total(&self) -> usize {
        self.builds + self.deploys + self.rule_applies + self.rule_deletes + self.certificates
    }
}

pub async fn recover(
    store: &dyn EntityStore,
    queue: &dyn TaskQueue,
) -> Result<RecoverySummary, WorkerError> {
    let mut tasks = Vec::new();
    let mut summary = RecoverySummary::default();

    for deployment in store
        .deployments_with_status(DeploymentStatus::Pending)
        .await?
    {
        summary.builds += 1;
        tasks.push(Task::BuildApplication(BuildApplicationRequest {
            app_id: deployment.application_id,
            deployment_id: deployment.id,
        }));
    }
    for deployment in store
        .deployments_with_status(DeploymentStatus::DeployPending)
        .await?
    {
        summary.deploys += 1;
        tasks.push(Task::DeployApplication(DeployApplicationRequest {
            app_id: deployment.application_id,
            deployment_id: deployment.id,
            ignore_proxy_update: false,
        }));
    }

    for rule in store.list_ingress_rules().await? {
        let request = RuleRequest { id: rule.id };
        match rule.status {
            RuleStatus::Pending => {
                summary.rule_applies += 1;
                tasks.push(Task::IngressRuleApply(request));
            }
            RuleStatus::Deleting => {
                summary.rule_deletes += 1;
                tasks.push(Task::IngressRuleDelete(request));
            }
            RuleStatus::Applied | RuleStatus::Failed => {}
        }
    }
    for rule in store.list_redirect_rules().await? {
        let request = RuleRequest { id: rule.id };
        match rule.status {
            RuleStatus::Pending => {
                summary.rule_applies += 1;
                tasks.push(Task::RedirectRuleApply(request));
            }
            RuleStatus::Deleting => {
                summary.rule_deletes += 1;
                tasks.push(Task::RedirectRuleDelete(request));
            }
            RuleStatus::Applied | RuleStatus::Failed => {}
        }
    }

    for domain in store.list_domains().await? {
        if domain.tls_status == TlsStatus::Pending {
            summary.certificates += 1;
            tasks.push(Task::SslGenerate(SslGenerateRequest {
                domain_id: domain.id,
            }));
        }
    }

    for task in tasks {
        queue.enqueue(task).await?;
    }
    log::info!(
        "Recovery queued {} build(s), {} deploy(s), {} rule apply(s), {} rule delete(s), {} certificate(s)",
        summary.builds,
        summary.deploys,
        summary.rule_applies,
        summary.rule_deletes,
        summary.certificates
    );
    Ok(summary)
}
