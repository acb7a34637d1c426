use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{WorkerContext, WorkerError, backend_for, round_keys};
use crate::model::{
    Application, Deployment, DeploymentStatus, Protocol, RuleStatus, Server, Upstream,
};
use crate::orchestrator::{RegistryAuth, ServiceSpec};
use crate::proxy::{
    BackendKey, ProxyControl, ProxyError, ProxyMutation, ProxyRoundLocks, ProxyTransactionSet,
};
use crate::queue::DeployApplicationRequest;
use crate::store::{Promotion, StoreError};

pub(super) async fn deploy_application(
    ctx: &WorkerContext,
    request: DeployApplicationRequest,
) -> Result<(), WorkerError> {
    let Some(deployment) = ctx.store.get_deployment(&request.deployment_id).await? else {
        log::warn!("Deployment {} no longer exists", request.deployment_id);
        return Ok(());
    };
    if deployment.application_id != request.app_id {
        log::warn!(
            "Deployment {} belongs to {}, not {}",
            deployment.id,
            deployment.application_id,
            request.app_id
        );
        return Ok(());
    }
    match deployment.status {
        DeploymentStatus::DeployPending | DeploymentStatus::Live => {}
        status => {
            log::debug!("Deployment {} is {status}, skipping deploy", deployment.id);
            return Ok(());
        }
    }
    let Some(app) = ctx.store.get_application(&deployment.application_id).await? else {
        log::warn!(
            "Application {} of deployment {} no longer exists",
            deployment.application_id,
            deployment.id
        );
        return Ok(());
    };

    let servers = ctx.store.list_servers().await?;
    let orchestrator = ctx.manager().await?;
    let auth = registry_auth(ctx, &deployment).await?;
    let spec = service_spec(ctx, &app, &deployment, &servers);

    // Promotion and the service update happen as one step per application,
    // so a slower deploy of an older build cannot overwrite a newer one.
    let deploy_guard = ctx
        .round_locks
        .acquire([ProxyRoundLocks::deployment_key(&app.id)])
        .await;
    match ctx.store.promote_to_live(&app.id, &deployment.id).await? {
        Promotion::Live {
            stalled: Some(stalled),
        } => {
            log::info!("Deployment {stalled} of {} superseded by {}", app.id, deployment.id);
        }
        Promotion::Live { stalled: None } => {}
        Promotion::Superseded { by } => {
            log::info!(
                "Deployment {} of {} is older than {by}, not deploying it",
                deployment.id,
                app.id
            );
            ctx.logger
                .finish(&deployment.id, format!("Superseded by deployment {by}"));
            return Ok(());
        }
    }

    let id = deployment.id.as_str();
    ctx.logger
        .log(id, format!("Deploying service {} with {}", spec.name, spec.image));
    let exists = orchestrator.service_exists(&spec.name).await?;
    let upserted = if exists {
        orchestrator.update_service(&spec, auth.as_ref()).await
    } else {
        orchestrator.create_service(&spec, auth.as_ref()).await
    };
    if let Err(e) = upserted {
        log::error!("Deploying {} failed: {e}", spec.name);
        if exists {
            if let Err(rollback) = orchestrator.rollback_service(&spec.name).await {
                log::error!("Rolling back {} failed: {rollback}", spec.name);
            }
        }
        ctx.logger.finish(id, format!("Deployment failed: {e}"));
        return Ok(());
    }
    ctx.logger.finish(id, format!("Service {} is live", spec.name));
    drop(deploy_guard);

    if !request.ignore_proxy_update {
        // The service is already running, a stale replica count only costs
        // capacity until the next deploy or rule change.
        if let Err(e) = resync_replicas(ctx, &app).await {
            log::error!("Replica resync for {} failed: {e}", app.name);
        }
    }
    Ok(())
}

async fn registry_auth(
    ctx: &WorkerContext,
    deployment: &Deployment,
) -> Result<Option<RegistryAuth>, WorkerError> {
    match &deployment.spec.upstream {
        Upstream::Image {
            registry_credential_id: Some(credential_id),
            ..
        } => {
            let credential = ctx
                .store
                .get_registry_credential(credential_id)
                .await?
                .ok_or_else(|| StoreError::not_found("registry credential", credential_id))?;
            Ok(Some(RegistryAuth {
                server: credential.url,
                username: credential.username,
                password: credential.password,
            }))
        }
        Upstream::Image { .. } => Ok(None),
        Upstream::Git(_) | Upstream::SourceTarball { .. } => Ok(ctx.settings.registry.auth()),
    }
}

fn service_spec(
    ctx: &WorkerContext,
    app: &Application,
    deployment: &Deployment,
    servers: &[Server],
) -> ServiceSpec {
    ServiceSpec {
        name: app.name.clone(),
        image: deployment.image_uri(&ctx.settings.registry.prefix),
        command: app.command.clone(),
        env: app.environment_pairs(),
        networks: vec![ctx.settings.swarm_network.clone()],
        mode: app.deployment_mode,
        volumes: app.volumes.clone(),
        capabilities: app.capabilities.clone(),
        sysctls: app.sysctls.clone(),
        placement_constraints: servers
            .iter()
            .filter(|server| !server.schedule_deployments)
            .map(|server| format!("node.hostname!={}", server.hostname))
            .collect(),
    }
}

/// Sizes existing backends to `replicas`. Backends not created yet are left
/// to the rule that will create them.
struct ReplicaSync {
    backends: Vec<BackendKey>,
    replicas: u32,
}

#[async_trait]
impl ProxyMutation for ReplicaSync {
    async fn apply(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
    ) -> Result<(), ProxyError> {
        for backend in &self.backends {
            if !proxy.is_backend_exist(transaction_id, backend).await? {
                continue;
            }
            if proxy.get_replica_count(transaction_id, backend).await? != self.replicas {
                proxy
                    .update_backend_replicas(transaction_id, backend, self.replicas)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Updates the replica count of every backend fronting `app`.
pub(super) async fn resync_replicas(
    ctx: &WorkerContext,
    app: &Application,
) -> Result<usize, WorkerError> {
    let backends: BTreeSet<BackendKey> = ctx
        .store
        .ingress_rules_for_application(&app.id)
        .await?
        .iter()
        .filter(|rule| rule.status != RuleStatus::Deleting && rule.protocol != Protocol::Udp)
        .filter_map(|rule| backend_for(rule, &app.name))
        .collect();
    if backends.is_empty() {
        return Ok(0);
    }

    let mutation = ReplicaSync {
        backends: backends.into_iter().collect(),
        replicas: ctx.backend_replicas(app).await?,
    };
    let _guard = ctx
        .round_locks
        .acquire(round_keys(Some(&app.id), None))
        .await;
    let nodes = ctx.proxy_nodes().await?;
    let committed = ProxyTransactionSet::run(nodes, &[&mutation]).await?;
    log::info!(
        "Resynced {} backend(s) of {} to {} replica(s) on {committed} proxy node(s)",
        mutation.backends.len(),
        app.name,
        mutation.replicas
    );
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use crate::model::DeploymentMode;
    use crate::queue::{BuildApplicationRequest, Task};
    use crate::testing::{Harness, git_spec, ingress_rule};
    use tokio_util::sync::CancellationToken;

    fn request(deployment_id: &str) -> DeployApplicationRequest {
        DeployApplicationRequest {
            app_id: "web".into(),
            deployment_id: deployment_id.into(),
            ignore_proxy_update: false,
        }
    }

    async fn live_count(harness: &Harness) -> usize {
        harness
            .store
            .list_deployments("web")
            .await
            .unwrap()
            .iter()
            .filter(|d| d.status == DeploymentStatus::Live)
            .count()
    }

    #[tokio::test]
    async fn test_git_deployment_goes_live() {
        let harness = Harness::new(1).await;
        harness.insert_deployment("d1", git_spec("main")).await;

        super::super::build::build_application(
            &harness.ctx,
            BuildApplicationRequest {
                app_id: "web".into(),
                deployment_id: "d1".into(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(
            harness.store.get_deployment("d1").await.unwrap().unwrap().status,
            DeploymentStatus::DeployPending
        );

        let tasks = harness.queue.tasks();
        assert_eq!(tasks.len(), 1);
        let Task::DeployApplication(deploy) = tasks[0].clone() else {
            panic!("expected a deploy task, got {:?}", tasks[0]);
        };
        assert_eq!(deploy.app_id, "web");
        assert_eq!(deploy.deployment_id, "d1");

        deploy_application(&harness.ctx, deploy).await.unwrap();
        assert_eq!(
            harness.store.get_deployment("d1").await.unwrap().unwrap().status,
            DeploymentStatus::Live
        );
        let service = harness.orchestrator.service("web").unwrap();
        assert_eq!(service.image, "registry.local/web:d1");
        assert_eq!(service.networks, vec!["wharf".to_string()]);
    }

    #[tokio::test]
    async fn test_redeploy_is_idempotent() {
        let harness = Harness::new(0).await;
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;

        deploy_application(&harness.ctx, request("d1")).await.unwrap();
        deploy_application(&harness.ctx, request("d1")).await.unwrap();

        assert_eq!(harness.orchestrator.count("create_service"), 1);
        assert_eq!(harness.orchestrator.count("update_service"), 1);
        assert_eq!(harness.orchestrator.service_count(), 1);
        assert_eq!(live_count(&harness).await, 1);
    }

    #[tokio::test]
    async fn test_single_live_deployment() {
        let harness = Harness::new(0).await;
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;
        deploy_application(&harness.ctx, request("d1")).await.unwrap();
        assert_eq!(live_count(&harness).await, 1);

        harness
            .insert_deployment_with_status("d2", DeploymentStatus::DeployPending)
            .await;
        deploy_application(&harness.ctx, request("d2")).await.unwrap();
        assert_eq!(live_count(&harness).await, 1);
        assert_eq!(
            harness.store.get_deployment("d1").await.unwrap().unwrap().status,
            DeploymentStatus::Stalled
        );

        // A late redelivery of the superseded deployment is a no-op.
        deploy_application(&harness.ctx, request("d1")).await.unwrap();
        assert_eq!(
            harness.store.get_deployment("d2").await.unwrap().unwrap().status,
            DeploymentStatus::Live
        );
        assert_eq!(live_count(&harness).await, 1);
    }

    #[tokio::test]
    async fn test_older_build_finishing_late_is_not_deployed() {
        let harness = Harness::new(0).await;
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;
        harness
            .insert_deployment_with_status("d2", DeploymentStatus::DeployPending)
            .await;

        deploy_application(&harness.ctx, request("d2")).await.unwrap();
        deploy_application(&harness.ctx, request("d1")).await.unwrap();

        let status = |id: &'static str| {
            let store = harness.store.clone();
            async move { store.get_deployment(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status("d1").await, DeploymentStatus::Stalled);
        assert_eq!(status("d2").await, DeploymentStatus::Live);
        assert_eq!(
            harness.orchestrator.service("web").unwrap().image,
            "registry.local/web:d2"
        );
        assert_eq!(harness.orchestrator.count("create_service"), 1);
        assert_eq!(harness.orchestrator.count("update_service"), 0);
    }

    #[tokio::test]
    async fn test_older_build_yields_to_newer_one_still_building() {
        let harness = Harness::new(0).await;
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;
        harness.insert_deployment("d2", git_spec("release")).await;

        deploy_application(&harness.ctx, request("d1")).await.unwrap();
        assert_eq!(
            harness.store.get_deployment("d1").await.unwrap().unwrap().status,
            DeploymentStatus::Stalled
        );
        assert!(harness.orchestrator.service("web").is_none());
    }

    #[tokio::test]
    async fn test_unbuilt_or_terminal_deployment_skipped() {
        let harness = Harness::new(0).await;
        for (id, status) in [
            ("d1", DeploymentStatus::Pending),
            ("d2", DeploymentStatus::Failed),
            ("d3", DeploymentStatus::Stopped),
        ] {
            harness.insert_deployment_with_status(id, status).await;
            deploy_application(&harness.ctx, request(id)).await.unwrap();
        }
        assert_eq!(harness.orchestrator.count("service_exists"), 0);
        assert_eq!(live_count(&harness).await, 0);
    }

    #[tokio::test]
    async fn test_deployment_of_other_application_skipped() {
        let harness = Harness::new(0).await;
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;
        let mut other = request("d1");
        other.app_id = "api".into();
        deploy_application(&harness.ctx, other).await.unwrap();
        assert_eq!(harness.orchestrator.count("service_exists"), 0);
    }

    #[tokio::test]
    async fn test_failed_update_rolls_back() {
        let harness = Harness::new(0).await;
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;
        deploy_application(&harness.ctx, request("d1")).await.unwrap();

        harness
            .insert_deployment_with_status("d2", DeploymentStatus::DeployPending)
            .await;
        harness.orchestrator.fail_on("update_service");
        deploy_application(&harness.ctx, request("d2")).await.unwrap();

        assert_eq!(harness.orchestrator.count("rollback_service"), 1);
        assert_eq!(
            harness.store.get_deployment("d2").await.unwrap().unwrap().status,
            DeploymentStatus::Live
        );
    }

    #[tokio::test]
    async fn test_failed_create_has_nothing_to_roll_back() {
        let harness = Harness::new(0).await;
        harness.orchestrator.fail_on("create_service");
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;
        deploy_application(&harness.ctx, request("d1")).await.unwrap();
        assert_eq!(harness.orchestrator.count("rollback_service"), 0);
    }

    #[tokio::test]
    async fn test_no_manager_requeues() {
        let harness = Harness::without_manager().await;
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;
        let err = deploy_application(&harness.ctx, request("d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NoManager));
        assert_eq!(
            harness.store.get_deployment("d1").await.unwrap().unwrap().status,
            DeploymentStatus::DeployPending
        );
    }

    #[tokio::test]
    async fn test_placement_excludes_unschedulable_nodes() {
        let harness = Harness::new(1).await;
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;
        deploy_application(&harness.ctx, request("d1")).await.unwrap();
        let service = harness.orchestrator.service("web").unwrap();
        assert_eq!(
            service.placement_constraints,
            vec!["node.hostname!=proxy-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_deploy_resyncs_backend_replicas() {
        let harness = Harness::new(2).await;
        harness
            .set_deployment_mode(DeploymentMode::Replicated { replicas: 3 })
            .await;
        let mut rule = ingress_rule("r1", Protocol::Https, 443, 8080);
        rule.status = RuleStatus::Applied;
        harness.store.insert_ingress_rule(rule).await.unwrap();
        for proxy in &harness.proxies {
            proxy.seed_backend("be_http_web_8080", 1);
        }
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;

        deploy_application(&harness.ctx, request("d1")).await.unwrap();
        for proxy in &harness.proxies {
            assert_eq!(proxy.replicas("be_http_web_8080"), Some(3));
            assert_eq!(proxy.count("commit_transaction"), 1);
        }
    }

    #[tokio::test]
    async fn test_ignore_proxy_update_skips_resync() {
        let harness = Harness::new(1).await;
        let mut rule = ingress_rule("r1", Protocol::Https, 443, 8080);
        rule.status = RuleStatus::Applied;
        harness.store.insert_ingress_rule(rule).await.unwrap();
        harness
            .insert_deployment_with_status("d1", DeploymentStatus::DeployPending)
            .await;

        let mut request = request("d1");
        request.ignore_proxy_update = true;
        deploy_application(&harness.ctx, request).await.unwrap();
        assert_eq!(harness.proxies[0].count("fetch_new_transaction"), 0);
    }
}
