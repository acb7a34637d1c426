//! Whole-application work: deletion and the sweep that follows a change in
//! where deployments may be scheduled.

use super::{WorkerContext, WorkerError, deploy, ingress};
use crate::model::DeploymentStatus;
use crate::queue::{DeleteApplicationRequest, DeployApplicationRequest, Task};

pub(super) async fn delete_application(
    ctx: &WorkerContext,
    request: DeleteApplicationRequest,
) -> Result<(), WorkerError> {
    let Some(app) = ctx.store.get_application(&request.app_id).await? else {
        log::debug!("Application {} already deleted", request.app_id);
        return Ok(());
    };

    for deployment in ctx.store.list_deployments(&app.id).await? {
        if deployment.status == DeploymentStatus::Pending
            && ctx.cancellations.cancel(&deployment.id)
        {
            log::info!("Stopped build of {} for deletion of {}", deployment.id, app.name);
        }
    }

    // Proxies first. A failed round leaves every row for the redelivery.
    let rules = ctx.store.ingress_rules_for_application(&app.id).await?;
    ingress::detach_application(ctx, &app, &rules).await?;

    let orchestrator = ctx.manager().await?;
    if orchestrator.service_exists(&app.name).await? {
        match orchestrator.remove_service(&app.name).await {
            Ok(()) => log::info!("Removed service {}", app.name),
            Err(e) => log::warn!("Removing service {} failed: {e}", app.name),
        }
    }

    ctx.store.delete_application(&app.id).await?;
    log::info!(
        "Deleted application {} with {} ingress rule(s)",
        app.name,
        rules.len()
    );
    Ok(())
}

/// Redeploys every live application so placement follows the servers that
/// accept deployments now, then resizes each application's backends once.
pub(super) async fn reschedule_applications(ctx: &WorkerContext) -> Result<(), WorkerError> {
    let mut redeployed = 0;
    for app in ctx.store.list_applications().await? {
        let live = ctx
            .store
            .list_deployments(&app.id)
            .await?
            .into_iter()
            .find(|deployment| deployment.status == DeploymentStatus::Live);
        let Some(live) = live else {
            continue;
        };
        ctx.queue
            .enqueue(Task::DeployApplication(DeployApplicationRequest {
                app_id: app.id.clone(),
                deployment_id: live.id,
                ignore_proxy_update: true,
            }))
            .await?;
        redeployed += 1;

        if let Err(e) = deploy::resync_replicas(ctx, &app).await {
            log::error!("Replica resync for {} failed: {e}", app.name);
        }
    }
    log::info!("Queued {redeployed} redeploy(s) after a scheduling change");
    Ok(())
}
