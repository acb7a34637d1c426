//! In-memory stand-ins for every external collaborator, and a harness that
//! wires them into a [`WorkerContext`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tempfile::TempDir;

use crate::git::{GitClient, GitError, GitRemote};
use crate::logs::{DeploymentLogger, LogSettings, LogSink};
use crate::model::{
    Application, BuildSpec, Deployment, DeploymentMode, DeploymentStatus, Domain, GitSource,
    GitTransport, IngressRule, Protocol, ProxyConfig, ProxyRole, RedirectProtocol, RuleStatus,
    Server, ServerStatus, SwarmRole, TlsStatus, Upstream,
};
use crate::orchestrator::{
    BuildProgress, ImageBuild, Orchestrator, OrchestratorConnector, OrchestratorError,
    ProgressStream, PushProgress, RegistryAuth, ServiceSpec,
};
use crate::proxy::{
    BackendKey, ListenerMode, ProxyConnector, ProxyControl, ProxyError, ProxyRoundLocks, UdpProxy,
};
use crate::pubsub::LogBroker;
use crate::queue::{CancellationRegistry, QueueError, Task, TaskQueue};
use crate::store::{EntityStore, MemoryStore};
use crate::tls::{
    CertificateIssuer, DomainVerifier, IssuedCertificate, SelfSignedIssuer, TlsError,
};
use crate::worker::{RegistrySettings, WorkerContext, WorkerSettings};

fn injected(operation: &'static str) -> ProxyError {
    ProxyError::Status {
        operation,
        status: 500,
        body: "injected".to_string(),
    }
}

/// Records calls as `"<operation> <args>"` and fails operations on request.
#[derive(Default)]
struct CallLog {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl CallLog {
    fn record(&self, operation: &'static str, args: &[&str]) -> bool {
        let mut line = operation.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().unwrap().push(line);
        self.failing.lock().unwrap().contains(operation)
    }

    fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .count()
    }
}

/// Proxy node that keeps its backends in memory. Mutations are visible
/// immediately, transactions only count.
pub struct FakeProxy {
    name: String,
    log: CallLog,
    backends: Mutex<HashMap<String, u32>>,
    next_transaction: AtomicUsize,
}

impl FakeProxy {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: CallLog::default(),
            backends: Mutex::new(HashMap::new()),
            next_transaction: AtomicUsize::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.log.fail_on(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.calls()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.log.count(operation)
    }

    pub fn seed_backend(&self, name: &str, replicas: u32) {
        self.backends
            .lock()
            .unwrap()
            .insert(name.to_string(), replicas);
    }

    pub fn replicas(&self, backend: &str) -> Option<u32> {
        self.backends.lock().unwrap().get(backend).copied()
    }

    fn check(&self, operation: &'static str, args: &[&str]) -> Result<(), ProxyError> {
        if self.log.record(operation, args) {
            Err(injected(operation))
        } else {
            Ok(())
        }
    }
}

fn redirect_protocol(protocol: RedirectProtocol) -> &'static str {
    match protocol {
        RedirectProtocol::Http => "http",
        RedirectProtocol::Https => "https",
    }
}

#[async_trait]
impl ProxyControl for FakeProxy {
    async fn fetch_new_transaction(&self) -> Result<String, ProxyError> {
        self.check("fetch_new_transaction", &[])?;
        let n = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{}-tx-{n}", self.name))
    }

    async fn commit_transaction(&self, transaction_id: &str) -> Result<(), ProxyError> {
        self.check("commit_transaction", &[transaction_id])
    }

    async fn delete_transaction(&self, transaction_id: &str) -> Result<(), ProxyError> {
        self.check("delete_transaction", &[transaction_id])
    }

    async fn is_backend_exist(
        &self,
        _transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<bool, ProxyError> {
        let name = backend.name();
        self.check("is_backend_exist", &[&name])?;
        Ok(self.backends.lock().unwrap().contains_key(&name))
    }

    async fn add_backend(
        &self,
        _transaction_id: &str,
        backend: &BackendKey,
        replicas: u32,
    ) -> Result<(), ProxyError> {
        let name = backend.name();
        self.check("add_backend", &[&name, &replicas.to_string()])?;
        self.backends.lock().unwrap().insert(name, replicas);
        Ok(())
    }

    async fn remove_backend(
        &self,
        _transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<(), ProxyError> {
        let name = backend.name();
        self.check("remove_backend", &[&name])?;
        self.backends.lock().unwrap().remove(&name);
        Ok(())
    }

    async fn get_replica_count(
        &self,
        _transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<u32, ProxyError> {
        let name = backend.name();
        self.check("get_replica_count", &[&name])?;
        self.replicas(&name)
            .ok_or_else(|| injected("get_replica_count"))
    }

    async fn update_backend_replicas(
        &self,
        _transaction_id: &str,
        backend: &BackendKey,
        replicas: u32,
    ) -> Result<(), ProxyError> {
        let name = backend.name();
        self.check("update_backend_replicas", &[&name, &replicas.to_string()])?;
        self.backends.lock().unwrap().insert(name, replicas);
        Ok(())
    }

    async fn add_http_link(
        &self,
        _transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.check("add_http_link", &[backend, domain])
    }

    async fn delete_http_link(
        &self,
        _transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.check("delete_http_link", &[backend, domain])
    }

    async fn add_https_link(
        &self,
        _transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.check("add_https_link", &[backend, domain])
    }

    async fn delete_https_link(
        &self,
        _transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.check("delete_https_link", &[backend, domain])
    }

    async fn add_tcp_link(
        &self,
        _transaction_id: &str,
        backend: &str,
        port: u16,
        domain: Option<&str>,
        mode: ListenerMode,
    ) -> Result<(), ProxyError> {
        self.check(
            "add_tcp_link",
            &[backend, &port.to_string(), domain.unwrap_or("-"), mode.as_ref()],
        )
    }

    async fn delete_tcp_link(
        &self,
        _transaction_id: &str,
        backend: &str,
        port: u16,
        domain: Option<&str>,
        mode: ListenerMode,
    ) -> Result<(), ProxyError> {
        self.check(
            "delete_tcp_link",
            &[backend, &port.to_string(), domain.unwrap_or("-"), mode.as_ref()],
        )
    }

    async fn add_redirect(
        &self,
        _transaction_id: &str,
        protocol: RedirectProtocol,
        domain: &str,
        redirect_url: &str,
    ) -> Result<(), ProxyError> {
        self.check(
            "add_redirect",
            &[redirect_protocol(protocol), domain, redirect_url],
        )
    }

    async fn delete_redirect(
        &self,
        _transaction_id: &str,
        protocol: RedirectProtocol,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.check("delete_redirect", &[redirect_protocol(protocol), domain])
    }

    async fn enable_https_redirect(
        &self,
        _transaction_id: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.check("enable_https_redirect", &[domain])
    }

    async fn disable_https_redirect(
        &self,
        _transaction_id: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.check("disable_https_redirect", &[domain])
    }

    async fn update_tls(
        &self,
        _transaction_id: &str,
        domain: &str,
        _private_key: &str,
        _full_chain: &str,
    ) -> Result<(), ProxyError> {
        self.check("update_tls", &[domain])
    }
}

#[derive(Default)]
pub struct FakeUdp {
    calls: AtomicUsize,
}

impl FakeUdp {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UdpProxy for FakeUdp {
    async fn add(&self, _port: u16, _target_port: u16, _service: &str) -> Result<(), ProxyError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(
        &self,
        _port: u16,
        _target_port: u16,
        _service: &str,
    ) -> Result<(), ProxyError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Hands out the fake proxy registered for each hostname.
pub struct FakeProxyConnector {
    proxies: HashMap<String, Arc<FakeProxy>>,
    udp: Arc<FakeUdp>,
}

impl ProxyConnector for FakeProxyConnector {
    fn control(&self, server: &Server) -> Result<Arc<dyn ProxyControl>, ProxyError> {
        self.proxies
            .get(&server.hostname)
            .map(|proxy| proxy.clone() as Arc<dyn ProxyControl>)
            .ok_or_else(|| ProxyError::InvalidResponse(format!("no proxy {}", server.hostname)))
    }

    fn udp(&self, _server: &Server) -> Result<Arc<dyn UdpProxy>, ProxyError> {
        Ok(self.udp.clone())
    }
}

/// Orchestrator holding services in a map. Builds succeed with the
/// configured output unless told to hang or fail.
#[derive(Default)]
pub struct FakeOrchestrator {
    log: CallLog,
    services: Mutex<BTreeMap<String, ServiceSpec>>,
    build_output: Mutex<Vec<BuildProgress>>,
    push_output: Mutex<Vec<PushProgress>>,
    hang_build: AtomicBool,
    built_tags: Mutex<Vec<String>>,
    dockerfiles: Mutex<Vec<String>>,
}

impl FakeOrchestrator {
    pub fn fail_on(&self, operation: &'static str) {
        self.log.fail_on(operation);
    }

    pub fn count(&self, operation: &str) -> usize {
        self.log.count(operation)
    }

    pub fn set_build_output(&self, output: Vec<BuildProgress>) {
        *self.build_output.lock().unwrap() = output;
    }

    pub fn set_push_output(&self, output: Vec<PushProgress>) {
        *self.push_output.lock().unwrap() = output;
    }

    /// Makes builds stream nothing until cancelled.
    pub fn hang_build(&self) {
        self.hang_build.store(true, Ordering::Relaxed);
    }

    pub fn service(&self, name: &str) -> Option<ServiceSpec> {
        self.services.lock().unwrap().get(name).cloned()
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    pub fn built_tags(&self) -> Vec<String> {
        self.built_tags.lock().unwrap().clone()
    }

    pub fn seen_dockerfiles(&self) -> Vec<String> {
        self.dockerfiles.lock().unwrap().clone()
    }

    fn check(&self, operation: &'static str, args: &[&str]) -> Result<(), OrchestratorError> {
        if self.log.record(operation, args) {
            Err(OrchestratorError::Context(format!("{operation} injected")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn service_exists(&self, name: &str) -> Result<bool, OrchestratorError> {
        self.check("service_exists", &[name])?;
        Ok(self.services.lock().unwrap().contains_key(name))
    }

    async fn create_service(
        &self,
        spec: &ServiceSpec,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError> {
        self.check("create_service", &[&spec.name])?;
        self.services
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn update_service(
        &self,
        spec: &ServiceSpec,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError> {
        self.check("update_service", &[&spec.name])?;
        let mut services = self.services.lock().unwrap();
        if !services.contains_key(&spec.name) {
            return Err(OrchestratorError::ServiceNotFound(spec.name.clone()));
        }
        services.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn rollback_service(&self, name: &str) -> Result<(), OrchestratorError> {
        self.check("rollback_service", &[name])
    }

    async fn remove_service(&self, name: &str) -> Result<(), OrchestratorError> {
        self.check("remove_service", &[name])?;
        self.services.lock().unwrap().remove(name);
        Ok(())
    }

    async fn build_image(
        &self,
        build: ImageBuild,
    ) -> Result<ProgressStream<BuildProgress>, OrchestratorError> {
        self.check("build_image", &[&build.tag])?;
        if let Ok(dockerfile) = std::fs::read_to_string(build.context_dir.join(&build.dockerfile)) {
            self.dockerfiles.lock().unwrap().push(dockerfile);
        }
        self.built_tags.lock().unwrap().push(build.tag);
        if self.hang_build.load(Ordering::Relaxed) {
            return Ok(Box::pin(stream::pending()));
        }
        let output = self.build_output.lock().unwrap().clone();
        Ok(Box::pin(stream::iter(output.into_iter().map(Ok))))
    }

    async fn push_image(
        &self,
        image: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<ProgressStream<PushProgress>, OrchestratorError> {
        self.check("push_image", &[image])?;
        let output = self.push_output.lock().unwrap().clone();
        Ok(Box::pin(stream::iter(output.into_iter().map(Ok))))
    }
}

pub struct FakeOrchestratorConnector(Arc<FakeOrchestrator>);

impl OrchestratorConnector for FakeOrchestratorConnector {
    fn connect(&self, _server: &Server) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
        Ok(self.0.clone())
    }
}

/// Remote whose branches all point at `abc123`. Clones create the checkout
/// directory with a single file in it.
#[derive(Default)]
pub struct FakeGit {
    log: CallLog,
}

impl FakeGit {
    pub fn fail_on(&self, operation: &'static str) {
        self.log.fail_on(operation);
    }

    pub fn count(&self, operation: &str) -> usize {
        self.log.count(operation)
    }

    fn check(&self, operation: &'static str, args: &[&str]) -> Result<(), GitError> {
        if self.log.record(operation, args) {
            Err(GitError::Command {
                command: operation,
                stderr: "injected".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GitClient for FakeGit {
    async fn latest_commit(&self, remote: &GitRemote, branch: &str) -> Result<String, GitError> {
        self.check("latest_commit", &[&remote.url, branch])?;
        Ok("abc123".to_string())
    }

    async fn clone_at(
        &self,
        remote: &GitRemote,
        branch: &str,
        commit: &str,
        dest: &Path,
    ) -> Result<(), GitError> {
        self.check("clone_at", &[&remote.url, branch, commit])?;
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("README.md"), "hello").await?;
        Ok(())
    }
}

/// Signs locally unless told to fail.
#[derive(Default)]
pub struct FakeIssuer {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeIssuer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn obtain(
        &self,
        domain: &str,
        private_key_pem: &str,
    ) -> Result<IssuedCertificate, TlsError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            return Err(TlsError::Order {
                domain: domain.to_string(),
                status: "Invalid".to_string(),
            });
        }
        SelfSignedIssuer.obtain(domain, private_key_pem).await
    }
}

pub struct FakeVerifier {
    calls: AtomicUsize,
    verified: AtomicBool,
}

impl Default for FakeVerifier {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            verified: AtomicBool::new(true),
        }
    }
}

impl FakeVerifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn set_verified(&self, verified: bool) {
        self.verified.store(verified, Ordering::Relaxed);
    }
}

#[async_trait]
impl DomainVerifier for FakeVerifier {
    async fn verify(&self, _domain: &str) -> Result<bool, TlsError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.verified.load(Ordering::Relaxed))
    }
}

/// Queue that only remembers what was enqueued.
#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<Task>>,
    closed: AtomicBool,
}

impl RecordingQueue {
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }

    /// Makes every later enqueue fail.
    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Relaxed);
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed(task.queue()));
        }
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

pub fn git_spec(branch: &str) -> BuildSpec {
    BuildSpec {
        upstream: Upstream::Git(GitSource {
            transport: GitTransport::Http,
            endpoint: "https://git.local".to_string(),
            owner: "acme".to_string(),
            repository: "web".to_string(),
            branch: branch.to_string(),
            ssh_user: "git".to_string(),
            credential_id: None,
            commit_hash: None,
            code_path: String::new(),
        }),
        dockerfile: "FROM alpine".to_string(),
        build_args: BTreeMap::new(),
    }
}

/// A Pending rule for application `web` without a domain.
pub fn ingress_rule(id: &str, protocol: Protocol, port: u16, target_port: u16) -> IngressRule {
    IngressRule {
        id: id.to_string(),
        application_id: "web".to_string(),
        domain_id: None,
        protocol,
        port,
        target_port,
        https_redirect: false,
        status: RuleStatus::Pending,
    }
}

fn server(hostname: &str, role: SwarmRole, proxy: bool) -> Server {
    Server {
        id: hostname.to_string(),
        hostname: hostname.to_string(),
        ip: "127.0.0.1".to_string(),
        swarm_role: role,
        status: ServerStatus::Online,
        // Proxy nodes only route, they do not run application tasks.
        schedule_deployments: !proxy,
        proxy: proxy.then_some(ProxyConfig {
            enabled: true,
            role: ProxyRole::Active,
        }),
        docker_endpoint: None,
    }
}

fn web_app() -> Application {
    Application {
        id: "web".to_string(),
        name: "web".to_string(),
        deployment_mode: DeploymentMode::Replicated { replicas: 1 },
        command: Vec::new(),
        capabilities: Vec::new(),
        sysctls: BTreeMap::new(),
        environment: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
        volumes: Vec::new(),
    }
}

/// Application `web`, a swarm manager `manager-1` and `proxy-1..=n`, all
/// backed by fakes.
pub struct Harness {
    pub ctx: Arc<WorkerContext>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<RecordingQueue>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub proxies: Vec<Arc<FakeProxy>>,
    pub udp: Arc<FakeUdp>,
    pub git: Arc<FakeGit>,
    pub issuer: Arc<FakeIssuer>,
    pub verifier: Arc<FakeVerifier>,
    _data_dir: TempDir,
    _sink: LogSink,
}

impl Harness {
    pub async fn new(proxy_count: usize) -> Self {
        Self::build(true, proxy_count).await
    }

    pub async fn without_manager() -> Self {
        Self::build(false, 0).await
    }

    async fn build(with_manager: bool, proxy_count: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_application(web_app()).await.unwrap();
        if with_manager {
            store
                .insert_server(server("manager-1", SwarmRole::Manager, false))
                .await
                .unwrap();
        }
        let mut proxies = Vec::new();
        for n in 1..=proxy_count {
            let hostname = format!("proxy-{n}");
            store
                .insert_server(server(&hostname, SwarmRole::Worker, true))
                .await
                .unwrap();
            proxies.push(FakeProxy::new(&hostname));
        }

        let queue = Arc::new(RecordingQueue::default());
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let udp = Arc::new(FakeUdp::default());
        let git = Arc::new(FakeGit::default());
        let issuer = Arc::new(FakeIssuer::default());
        let verifier = Arc::new(FakeVerifier::default());
        let data_dir = tempfile::tempdir().unwrap();
        let (logger, sink) = DeploymentLogger::new(
            Arc::new(LogBroker::new()),
            store.clone(),
            LogSettings::default(),
        );

        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            queue: queue.clone(),
            orchestrators: Arc::new(FakeOrchestratorConnector(orchestrator.clone())),
            proxies: Arc::new(FakeProxyConnector {
                proxies: proxies
                    .iter()
                    .map(|proxy| (proxy.name().to_string(), proxy.clone()))
                    .collect(),
                udp: udp.clone(),
            }),
            git: git.clone(),
            issuer: issuer.clone(),
            verifier: verifier.clone(),
            logger,
            cancellations: Arc::new(CancellationRegistry::new()),
            round_locks: Arc::new(ProxyRoundLocks::new()),
            settings: WorkerSettings {
                data_dir: data_dir.path().to_path_buf(),
                swarm_network: "wharf".to_string(),
                registry: RegistrySettings {
                    prefix: "registry.local".to_string(),
                    username: "ci".to_string(),
                    password: "secret".to_string(),
                },
                renew_before_days: 15,
            },
        });

        Self {
            ctx,
            store,
            queue,
            orchestrator,
            proxies,
            udp,
            git,
            issuer,
            verifier,
            _data_dir: data_dir,
            _sink: sink,
        }
    }

    pub async fn insert_deployment(&self, id: &str, spec: BuildSpec) {
        self.store
            .insert_deployment(Deployment::new(id, "web", spec))
            .await
            .unwrap();
    }

    pub async fn insert_deployment_with_status(&self, id: &str, status: DeploymentStatus) {
        self.insert_deployment(id, git_spec("main")).await;
        self.store
            .update_deployment_status(id, status)
            .await
            .unwrap();
    }

    pub async fn insert_domain(&self, id: &str, name: &str) {
        self.store
            .insert_domain(Domain {
                id: id.to_string(),
                name: name.to_string(),
                tls_status: TlsStatus::None,
                private_key: String::new(),
                full_chain: String::new(),
                issued_at: None,
                expires_at: None,
                issuer: String::new(),
                auto_renew: true,
            })
            .await
            .unwrap();
    }

    pub async fn set_deployment_mode(&self, mode: DeploymentMode) {
        let mut app = web_app();
        app.deployment_mode = mode;
        self.store.insert_application(app).await.unwrap();
    }
}
