//! Task handlers and the context they share.
//!
//! Every collaborator a handler touches is reached through [`WorkerContext`],
//! so the pipelines run unchanged against the real clients or test fakes.

mod application;
mod build;
mod deploy;
mod ingress;
mod redirect;
mod ssl;
mod sync;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::git::{GitClient, GitError};
use crate::logs::DeploymentLogger;
use crate::model::{
    Application, BuildSpec, Deployment, IngressRule, Protocol, Replacement, Server,
    decide_replacement,
};
use crate::orchestrator::{
    Orchestrator, OrchestratorConnector, OrchestratorError, RegistryAuth, registry_host,
};
use crate::proxy::{
    BackendKey, ListenerMode, ProxyConnector, ProxyError, ProxyNode, ProxyRoundLocks, RoundError,
    UdpProxy,
};
use crate::queue::{
    BuildApplicationRequest, CancellationRegistry, DeleteApplicationRequest, QueueError, Task,
    TaskHandler, TaskQueue,
};
use crate::store::{EntityStore, StoreError};
use crate::tls::{CertificateIssuer, DomainVerifier, TlsError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("proxy round failed: {0}")]
    Round(#[from] RoundError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no online swarm manager")]
    NoManager,
    #[error("build failed: {0}")]
    Build(String),
    #[error("cancelled")]
    Cancelled,
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    /// Failures that say nothing about the entity itself. A handler hitting
    /// one leaves the row untouched and asks for redelivery.
    pub fn is_transient(&self) -> bool {
        match self {
            // A missing referenced row will not appear on redelivery.
            WorkerError::Store(StoreError::NotFound { .. }) => false,
            WorkerError::Store(_) | WorkerError::Queue(_) | WorkerError::NoManager => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySettings {
    /// Prepended to built image names, `registry.local:5000` or `ghcr.io/acme`.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl RegistrySettings {
    /// Credentials for the configured registry, if any were given.
    pub fn auth(&self) -> Option<RegistryAuth> {
        if self.username.is_empty() {
            return None;
        }
        Some(RegistryAuth {
            server: registry_host(&format!("{}/", self.prefix)).to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Holds uploaded source archives.
    pub data_dir: PathBuf,
    pub swarm_network: String,
    pub registry: RegistrySettings,
    /// Certificates expiring sooner than this are issued again.
    pub renew_before_days: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/wharf"),
            swarm_network: "wharf".to_string(),
            registry: RegistrySettings::default(),
            renew_before_days: 15,
        }
    }
}

pub struct WorkerContext {
    pub store: Arc<dyn EntityStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub orchestrators: Arc<dyn OrchestratorConnector>,
    pub proxies: Arc<dyn ProxyConnector>,
    pub git: Arc<dyn GitClient>,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub verifier: Arc<dyn DomainVerifier>,
    pub logger: DeploymentLogger,
    pub cancellations: Arc<CancellationRegistry>,
    pub round_locks: Arc<ProxyRoundLocks>,
    pub settings: WorkerSettings,
}

impl WorkerContext {
    /// Client for the first online swarm manager.
    async fn manager(&self) -> Result<Arc<dyn Orchestrator>, WorkerError> {
        let servers = self.store.list_servers().await?;
        let manager = servers
            .iter()
            .find(|server| server.is_swarm_manager())
            .ok_or(WorkerError::NoManager)?;
        Ok(self.orchestrators.connect(manager)?)
    }

    async fn active_proxies(&self) -> Result<Vec<Server>, WorkerError> {
        Ok(self
            .store
            .list_servers()
            .await?
            .into_iter()
            .filter(Server::is_active_proxy)
            .collect())
    }

    /// Control clients for every active proxy node. A node whose client
    /// cannot be built is left out, as if it failed to open a transaction.
    async fn proxy_nodes(&self) -> Result<Vec<ProxyNode>, WorkerError> {
        let mut nodes = Vec::new();
        for server in self.active_proxies().await? {
            match self.proxies.control(&server) {
                Ok(control) => nodes.push(ProxyNode {
                    hostname: server.hostname,
                    control,
                }),
                Err(e) => log::warn!("Skipping proxy {}: {e}", server.hostname),
            }
        }
        Ok(nodes)
    }

    async fn udp_proxies(&self) -> Result<Vec<(String, Arc<dyn UdpProxy>)>, WorkerError> {
        let mut proxies = Vec::new();
        for server in self.active_proxies().await? {
            match self.proxies.udp(&server) {
                Ok(udp) => proxies.push((server.hostname, udp)),
                Err(e) => log::warn!("Skipping UDP proxy {}: {e}", server.hostname),
            }
        }
        Ok(proxies)
    }

    /// Replica count the backends of `app` should carry.
    async fn backend_replicas(&self, app: &Application) -> Result<u32, WorkerError> {
        let schedulable = self
            .store
            .list_servers()
            .await?
            .iter()
            .filter(|server| server.is_online() && server.schedule_deployments)
            .count();
        Ok(app.backend_replicas(schedulable))
    }
}

/// Proxy backend fronting `rule`. UDP rules bypass the proxy backends.
fn backend_for(rule: &IngressRule, service: &str) -> Option<BackendKey> {
    let mode = match rule.protocol {
        Protocol::Http | Protocol::Https => ListenerMode::Http,
        Protocol::Tcp => ListenerMode::Tcp,
        Protocol::Udp => return None,
    };
    Some(BackendKey::new(mode, service, rule.target_port))
}

/// Lock keys of a round touching `app_id` and, when present, `domain`.
fn round_keys(app_id: Option<&str>, domain: Option<&str>) -> BTreeSet<String> {
    app_id
        .map(ProxyRoundLocks::application_key)
        .into_iter()
        .chain(domain.map(ProxyRoundLocks::domain_key))
        .collect()
}

/// Routes each task to its pipeline.
pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskHandler for Dispatcher {
    async fn handle(&self, task: Task, cancel: CancellationToken) -> Result<(), WorkerError> {
        let ctx = self.ctx.as_ref();
        match task {
            Task::BuildApplication(request) => build::build_application(ctx, request, cancel).await,
            Task::DeployApplication(request) => deploy::deploy_application(ctx, request).await,
            Task::IngressRuleApply(request) => ingress::apply(ctx, request).await,
            Task::IngressRuleDelete(request) => ingress::delete(ctx, request).await,
            Task::IngressRuleHttpsRedirect(request) => {
                ingress::toggle_https_redirect(ctx, request).await
            }
            Task::RedirectRuleApply(request) => redirect::apply(ctx, request).await,
            Task::RedirectRuleDelete(request) => redirect::delete(ctx, request).await,
            Task::SslGenerate(request) => ssl::generate(ctx, request).await,
            Task::SyncProxyState => sync::sync_proxy_state(ctx).await.map(|_| ()),
            Task::DeleteApplication(request) => {
                application::delete_application(ctx, request).await
            }
            Task::RescheduleApplications => application::reschedule_applications(ctx).await,
        }
    }
}

/// Records a deployment request for `app_id`.
///
/// A spec identical to the latest deployment's returns that deployment's id
/// while it is still building, deploying or live. Anything else, including a
/// resubmission after a failed or superseded deployment, appends a Pending
/// row and queues its build.
pub async fn submit_deployment(
    store: &dyn EntityStore,
    queue: &dyn TaskQueue,
    app_id: &str,
    spec: BuildSpec,
) -> Result<String, WorkerError> {
    if store.get_application(app_id).await?.is_none() {
        return Err(StoreError::not_found("application", app_id).into());
    }
    if let Some(latest) = store.latest_deployment(app_id).await?
        && !latest.status.is_terminal()
        && decide_replacement(&latest.spec, &spec) == Replacement::NoOp
    {
        log::info!(
            "Deployment request for {app_id} matches {}, nothing to do",
            latest.id
        );
        return Ok(latest.id);
    }

    let deployment = Deployment::new(Uuid::now_v7().to_string(), app_id, spec);
    let id = deployment.id.clone();
    log::info!(
        "Creating deployment {id} for {app_id} from {} upstream",
        deployment.spec.upstream.kind()
    );
    store.insert_deployment(deployment).await?;
    queue
        .enqueue(Task::BuildApplication(BuildApplicationRequest {
            app_id: app_id.to_string(),
            deployment_id: id.clone(),
        }))
        .await?;
    Ok(id)
}

/// Queues removal of `app_id` with its deployments, rules and service.
pub async fn request_application_deletion(
    store: &dyn EntityStore,
    queue: &dyn TaskQueue,
    app_id: &str,
) -> Result<(), WorkerError> {
    if store.get_application(app_id).await?.is_none() {
        return Err(StoreError::not_found("application", app_id).into());
    }
    queue
        .enqueue(Task::DeleteApplication(DeleteApplicationRequest {
            app_id: app_id.to_string(),
        }))
        .await?;
    log::info!("Deletion of {app_id} queued");
    Ok(())
}

/// Allows or forbids deployments on `server_id`, then queues the sweep that
/// moves live applications onto the new placement.
pub async fn set_server_schedule(
    store: &dyn EntityStore,
    queue: &dyn TaskQueue,
    server_id: &str,
    schedule: bool,
) -> Result<(), WorkerError> {
    store.set_server_schedule(server_id, schedule).await?;
    log::info!(
        "Deployments {} on {server_id}",
        if schedule { "enabled" } else { "disabled" }
    );
    queue.enqueue(Task::RescheduleApplications).await?;
    Ok(())
}
