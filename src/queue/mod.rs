//! Typed tasks, the queue contract and the in-process queue.

mod cancel;
mod local;

pub use cancel::{CancellationGuard, CancellationRegistry};
pub use local::{LocalTaskQueue, QueueSettings};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::worker::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    BuildApplication,
    DeployApplication,
    IngressRuleApply,
    IngressRuleDelete,
    IngressRuleHttpsRedirect,
    RedirectRuleApply,
    RedirectRuleDelete,
    SslGenerate,
    SyncProxyState,
    DeleteApplication,
    RescheduleApplications,
}

impl QueueName {
    pub const ALL: [QueueName; 11] = [
        QueueName::BuildApplication,
        QueueName::DeployApplication,
        QueueName::IngressRuleApply,
        QueueName::IngressRuleDelete,
        QueueName::IngressRuleHttpsRedirect,
        QueueName::RedirectRuleApply,
        QueueName::RedirectRuleDelete,
        QueueName::SslGenerate,
        QueueName::SyncProxyState,
        QueueName::DeleteApplication,
        QueueName::RescheduleApplications,
    ];
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        match self {
            QueueName::BuildApplication => "build_application",
            QueueName::DeployApplication => "deploy_application",
            QueueName::IngressRuleApply => "ingress_rule_apply",
            QueueName::IngressRuleDelete => "ingress_rule_delete",
            QueueName::IngressRuleHttpsRedirect => "ingress_rule_https_redirect",
            QueueName::RedirectRuleApply => "redirect_rule_apply",
            QueueName::RedirectRuleDelete => "redirect_rule_delete",
            QueueName::SslGenerate => "ssl_generate",
            QueueName::SyncProxyState => "sync_proxy_state",
            QueueName::DeleteApplication => "delete_application",
            QueueName::RescheduleApplications => "reschedule_applications",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildApplicationRequest {
    pub app_id: String,
    pub deployment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployApplicationRequest {
    pub app_id: String,
    pub deployment_id: String,
    /// Skips the replica resync, used by sweeps that redeploy many services.
    #[serde(default)]
    pub ignore_proxy_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpsRedirectRequest {
    pub id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslGenerateRequest {
    pub domain_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteApplicationRequest {
    pub app_id: String,
}

/// One unit of work, tagged with the queue it travels on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "queue", content = "payload", rename_all = "snake_case")]
pub enum Task {
    BuildApplication(BuildApplicationRequest),
    DeployApplication(DeployApplicationRequest),
    IngressRuleApply(RuleRequest),
    IngressRuleDelete(RuleRequest),
    IngressRuleHttpsRedirect(HttpsRedirectRequest),
    RedirectRuleApply(RuleRequest),
    RedirectRuleDelete(RuleRequest),
    SslGenerate(SslGenerateRequest),
    /// Re-applies every settled rule and certificate to every proxy node.
    SyncProxyState,
    DeleteApplication(DeleteApplicationRequest),
    /// Redeploys every live application after server scheduling changed.
    RescheduleApplications,
}

impl Task {
    pub fn queue(&self) -> QueueName {
        match self {
            Task::BuildApplication(_) => QueueName::BuildApplication,
            Task::DeployApplication(_) => QueueName::DeployApplication,
            Task::IngressRuleApply(_) => QueueName::IngressRuleApply,
            Task::IngressRuleDelete(_) => QueueName::IngressRuleDelete,
            Task::IngressRuleHttpsRedirect(_) => QueueName::IngressRuleHttpsRedirect,
            Task::RedirectRuleApply(_) => QueueName::RedirectRuleApply,
            Task::RedirectRuleDelete(_) => QueueName::RedirectRuleDelete,
            Task::SslGenerate(_) => QueueName::SslGenerate,
            Task::SyncProxyState => QueueName::SyncProxyState,
            Task::DeleteApplication(_) => QueueName::DeleteApplication,
            Task::RescheduleApplications => QueueName::RescheduleApplications,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue {0} is closed")]
    Closed(QueueName),
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;
}

/// Receives tasks from one or more queues.
///
/// `Ok` acknowledges the task. `Err` asks the queue to deliver it again
/// later. The token is cancelled when the process shuts down.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task, cancel: CancellationToken) -> Result<(), WorkerError>;
}
