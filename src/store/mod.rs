//! Entity store used by every worker.
//!
//! Each call is one short, self-contained operation. Workers never hold a
//! store operation open across an orchestrator, registry or proxy call.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::model::{
    Application, Deployment, DeploymentLog, DeploymentStatus, Domain, GitCredential, IngressRule,
    RedirectRule, RegistryCredential, RuleStatus, Server, TlsStatus,
};

/// Outcome of [`EntityStore::promote_to_live`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// The deployment is Live. Carries the id of the row it replaced.
    Live { stalled: Option<String> },
    /// A newer deployment won. The target was marked Stalled.
    Superseded { by: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("deployment {deployment} does not belong to application {application}")]
    Mismatch {
        application: String,
        deployment: String,
    },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError>;
    async fn list_applications(&self) -> Result<Vec<Application>, StoreError>;
    /// Removes an application with its deployments and ingress rules.
    async fn delete_application(&self, id: &str) -> Result<(), StoreError>;

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError>;
    /// Most recently created deployment of an application.
    async fn latest_deployment(&self, app_id: &str) -> Result<Option<Deployment>, StoreError>;
    async fn list_deployments(&self, app_id: &str) -> Result<Vec<Deployment>, StoreError>;
    async fn deployments_with_status(
        &self,
        status: DeploymentStatus,
    ) -> Result<Vec<Deployment>, StoreError>;
    async fn insert_deployment(&self, deployment: Deployment) -> Result<(), StoreError>;
    async fn update_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
    ) -> Result<(), StoreError>;
    async fn set_commit_hash(&self, id: &str, commit_hash: &str) -> Result<(), StoreError>;
    /// Marks `deployment_id` Live and the application's current Live row
    /// Stalled as one operation.
    ///
    /// A DeployPending row with a newer deployment that is still building,
    /// deploying or live is marked Stalled instead and left out of service.
    async fn promote_to_live(
        &self,
        app_id: &str,
        deployment_id: &str,
    ) -> Result<Promotion, StoreError>;

    async fn get_ingress_rule(&self, id: &str) -> Result<Option<IngressRule>, StoreError>;
    async fn list_ingress_rules(&self) -> Result<Vec<IngressRule>, StoreError>;
    async fn ingress_rules_for_application(
        &self,
        app_id: &str,
    ) -> Result<Vec<IngressRule>, StoreError>;
    async fn update_ingress_rule_status(
        &self,
        id: &str,
        status: RuleStatus,
    ) -> Result<(), StoreError>;
    async fn set_https_redirect(&self, id: &str, enabled: bool) -> Result<(), StoreError>;
    async fn delete_ingress_rule(&self, id: &str) -> Result<(), StoreError>;

    async fn get_redirect_rule(&self, id: &str) -> Result<Option<RedirectRule>, StoreError>;
    async fn list_redirect_rules(&self) -> Result<Vec<RedirectRule>, StoreError>;
    async fn update_redirect_rule_status(
        &self,
        id: &str,
        status: RuleStatus,
    ) -> Result<(), StoreError>;
    async fn delete_redirect_rule(&self, id: &str) -> Result<(), StoreError>;

    async fn get_domain(&self, id: &str) -> Result<Option<Domain>, StoreError>;
    async fn list_domains(&self) -> Result<Vec<Domain>, StoreError>;
    async fn update_domain(&self, domain: Domain) -> Result<(), StoreError>;
    async fn update_tls_status(&self, id: &str, status: TlsStatus) -> Result<(), StoreError>;

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError>;
    async fn set_server_schedule(&self, id: &str, schedule: bool) -> Result<(), StoreError>;

    async fn get_git_credential(&self, id: &str) -> Result<Option<GitCredential>, StoreError>;
    async fn get_registry_credential(
        &self,
        id: &str,
    ) -> Result<Option<RegistryCredential>, StoreError>;

    async fn append_deployment_logs(&self, logs: Vec<DeploymentLog>) -> Result<(), StoreError>;
    async fn deployment_logs(&self, deployment_id: &str)
    -> Result<Vec<DeploymentLog>, StoreError>;
}
