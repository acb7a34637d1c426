use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use wharf::config::WharfConfig;
use wharf::git::GitCli;
use wharf::logs::DeploymentLogger;
use wharf::orchestrator::DockerConnector;
use wharf::proxy::{DataPlaneConnector, ProxyRoundLocks};
use wharf::pubsub::LogBroker;
use wharf::queue::{CancellationRegistry, LocalTaskQueue, QueueName, TaskQueue};
use wharf::reconcile::ProxySync;
use wharf::renewal::RenewalScan;
use wharf::store::{EntityStore, MemoryStore};
use wharf::tls::{
    AcmeIssuer, CertificateIssuer, ChallengeStore, HttpDomainVerifier, SelfSignedIssuer,
    serve_challenges,
};
use wharf::worker::{Dispatcher, WorkerContext};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = WharfConfig::try_init()?;
    let shutdown = CancellationToken::new();
    wharf::signals::handle_shutdown(shutdown.clone())?;

    let store: Arc<MemoryStore> = match &config.state_file {
        Some(path) => Arc::new(MemoryStore::open(path).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let queue = Arc::new(LocalTaskQueue::new(config.queue.clone()));

    let challenges = Arc::new(ChallengeStore::new());
    let issuer: Arc<dyn CertificateIssuer> = if config.ssl.simulate {
        log::warn!("Simulating certificate issuance with self-signed certificates");
        Arc::new(SelfSignedIssuer)
    } else {
        Arc::new(AcmeIssuer::new(config.ssl.acme()?, challenges.clone()))
    };
    let verifier = HttpDomainVerifier::new(Duration::from_secs(config.ssl.verify_timeout_secs))?;

    let (logger, sink) =
        DeploymentLogger::new(Arc::new(LogBroker::new()), store.clone(), config.logs.clone());

    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        queue: queue.clone(),
        orchestrators: Arc::new(DockerConnector::new(config.docker.timeout_secs)),
        proxies: Arc::new(DataPlaneConnector::new(config.proxy.clone())?),
        git: Arc::new(GitCli::new()),
        issuer,
        verifier: Arc::new(verifier),
        logger,
        cancellations: Arc::new(CancellationRegistry::new()),
        round_locks: Arc::new(ProxyRoundLocks::new()),
        settings: config.worker_settings(),
    });
    let dispatcher = Arc::new(Dispatcher::new(ctx));
    for name in QueueName::ALL {
        queue.register(name, dispatcher.clone());
    }

    // The sink outlives the queues so lines written by draining tasks land.
    let sink_shutdown = CancellationToken::new();
    let sink_task = tokio::spawn(sink.run(sink_shutdown.clone()));
    let mut dispatchers = queue.start(shutdown.clone());

    let challenge_shutdown = shutdown.clone();
    let challenge_addr = config.ssl.challenge_addr;
    tokio::spawn(async move {
        if let Err(err) = serve_challenges(challenge_addr, challenges, challenge_shutdown).await {
            log::error!("ACME challenge server stopped: {err}");
        }
    });

    let renewal = RenewalScan::new(
        store.clone(),
        queue.clone(),
        config.ssl.renew_before_days,
    );
    tokio::spawn(renewal.run(config.ssl.renewal_schedule()?, shutdown.clone()));
    let proxy_sync = ProxySync::new(queue.clone());
    tokio::spawn(proxy_sync.run(config.proxy_sync_schedule()?, shutdown.clone()));

    let store: Arc<dyn EntityStore> = store;
    let queue: Arc<dyn TaskQueue> = queue;
    wharf::recovery::recover(store.as_ref(), queue.as_ref()).await?;
    wharf::signals::handle_reload(store, queue, tokio::runtime::Handle::current())?;

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
    log::info!("wharf is ready");

    shutdown.cancelled().await;
    while dispatchers.join_next().await.is_some() {}
    sink_shutdown.cancel();
    let _ = sink_task.await;
    log::info!("Stopped");
    Ok(())
}
