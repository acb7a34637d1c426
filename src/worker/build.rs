use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use futures::StreamExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{WorkerContext, WorkerError};
use crate::git::GitRemote;
use crate::logs::PushProgressTable;
use crate::model::{Deployment, DeploymentStatus, GitSource, Upstream};
use crate::orchestrator::{BuildProgress, ImageBuild, Orchestrator};
use crate::queue::{BuildApplicationRequest, DeployApplicationRequest, Task};
use crate::store::StoreError;

const DOCKERFILE: &str = "Dockerfile";

pub(super) async fn build_application(
    ctx: &WorkerContext,
    request: BuildApplicationRequest,
    cancel: CancellationToken,
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
    if deployment.status != DeploymentStatus::Pending {
        log::debug!(
            "Deployment {} is {}, skipping build",
            deployment.id,
            deployment.status
        );
        return Ok(());
    }

    let guard = ctx.cancellations.register(&deployment.id, &cancel);
    let result = run_build(ctx, &deployment, guard.token()).await;
    drop(guard);

    match result {
        Ok(()) => {
            ctx.store
                .update_deployment_status(&deployment.id, DeploymentStatus::DeployPending)
                .await?;
            let queued = ctx
                .queue
                .enqueue(Task::DeployApplication(DeployApplicationRequest {
                    app_id: deployment.application_id.clone(),
                    deployment_id: deployment.id.clone(),
                    ignore_proxy_update: false,
                }))
                .await;
            if let Err(e) = queued {
                // Back to Pending so the redelivered build passes its guard
                // and queues the deploy again.
                log::warn!("Queueing deploy of {} failed: {e}", deployment.id);
                if let Err(revert) = ctx
                    .store
                    .update_deployment_status(&deployment.id, DeploymentStatus::Pending)
                    .await
                {
                    log::error!("Resetting {} to pending failed: {revert}", deployment.id);
                }
                return Err(e.into());
            }
            Ok(())
        }
        // Shutdown, not the user. The row stays Pending for the recovery scan.
        Err(WorkerError::Cancelled) if cancel.is_cancelled() => {
            log::warn!("Build of {} interrupted by shutdown", deployment.id);
            Err(WorkerError::Cancelled)
        }
        Err(e) if e.is_transient() => {
            log::warn!("Build of {} interrupted, will retry: {e}", deployment.id);
            Err(e)
        }
        Err(e) => {
            let message = match &e {
                WorkerError::Cancelled => "Deployment cancelled by user".to_string(),
                other => format!("Build failed: {other}"),
            };
            log::error!("Build of deployment {} failed: {e}", deployment.id);
            ctx.logger.finish(&deployment.id, message);
            ctx.store
                .update_deployment_status(&deployment.id, DeploymentStatus::Failed)
                .await?;
            Ok(())
        }
    }
}

async fn run_build(
    ctx: &WorkerContext,
    deployment: &Deployment,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let id = deployment.id.as_str();
    if let Upstream::Image { image, .. } = &deployment.spec.upstream {
        ctx.logger
            .log(id, format!("No build required, deploying image {image}"));
        return Ok(());
    }

    // Removed when dropped, whichever way the build ends.
    let workdir = tempfile::tempdir()?;
    let context = match &deployment.spec.upstream {
        Upstream::Git(source) => checkout(ctx, deployment, source, workdir.path(), cancel).await?,
        Upstream::SourceTarball {
            archive_name,
            code_path,
        } => {
            let archive = safe_join(&ctx.settings.data_dir, archive_name)?;
            ctx.logger.log(id, "Extracting source archive");
            extract_archive(&archive, workdir.path()).await?;
            safe_join(workdir.path(), code_path)?
        }
        Upstream::Image { .. } => return Ok(()),
    };
    build_and_push(ctx, deployment, context, cancel).await
}

/// Resolves the branch head, records it and clones the repository at it.
/// Returns the build context directory.
async fn checkout(
    ctx: &WorkerContext,
    deployment: &Deployment,
    source: &GitSource,
    workdir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, WorkerError> {
    let id = deployment.id.as_str();
    let credential = match &source.credential_id {
        Some(credential_id) => Some(
            ctx.store
                .get_git_credential(credential_id)
                .await?
                .ok_or_else(|| StoreError::not_found("git credential", credential_id))?,
        ),
        None => None,
    };
    let remote = GitRemote::new(source, credential);

    ctx.logger
        .log(id, format!("Fetching latest commit of {}", source.branch));
    let commit = tokio::select! {
        _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        commit = ctx.git.latest_commit(&remote, &source.branch) => commit?,
    };
    ctx.store.set_commit_hash(id, &commit).await?;

    ctx.logger
        .log(id, format!("Cloning {} at {commit}", remote.url));
    let checkout_dir = workdir.join("source");
    tokio::select! {
        _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        cloned = ctx.git.clone_at(&remote, &source.branch, &commit, &checkout_dir) => cloned?,
    }
    safe_join(&checkout_dir, &source.code_path)
}

async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), WorkerError> {
    let output = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        return Err(WorkerError::Build(format!(
            "could not extract {}: {}",
            archive.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Joins a user supplied relative path, refusing anything that leaves `base`.
fn safe_join(base: &Path, relative: &str) -> Result<PathBuf, WorkerError> {
    let relative = Path::new(relative.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(WorkerError::Build(format!(
            "path {} escapes the build directory",
            relative.display()
        )));
    }
    Ok(base.join(relative))
}

async fn build_and_push(
    ctx: &WorkerContext,
    deployment: &Deployment,
    context_dir: PathBuf,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let id = deployment.id.as_str();
    if !context_dir.is_dir() {
        return Err(WorkerError::Build(format!(
            "build context {} does not exist",
            context_dir.display()
        )));
    }
    if !deployment.spec.dockerfile.is_empty() {
        tokio::fs::write(context_dir.join(DOCKERFILE), &deployment.spec.dockerfile).await?;
    }

    let orchestrator = ctx.manager().await?;
    let image = deployment.image_uri(&ctx.settings.registry.prefix);
    ctx.logger.log(id, format!("Building image {image}"));
    let mut stream = orchestrator
        .build_image(ImageBuild {
            context_dir,
            dockerfile: DOCKERFILE.to_string(),
            tag: image.clone(),
            build_args: deployment.spec.build_args.clone(),
        })
        .await?;
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            item = stream.next() => item,
        };
        match item {
            None => break,
            Some(Ok(BuildProgress::Output(line))) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    ctx.logger.log(id, line);
                }
            }
            Some(Ok(BuildProgress::Error(message))) => return Err(WorkerError::Build(message)),
            Some(Err(e)) => return Err(e.into()),
        }
    }
    ctx.logger.log(id, "Image built");

    if ctx.settings.registry.prefix.is_empty() {
        ctx.logger.log(id, "No registry configured, keeping image local");
        return Ok(());
    }
    push(ctx, orchestrator.as_ref(), id, &image, cancel).await
}

async fn push(
    ctx: &WorkerContext,
    orchestrator: &dyn Orchestrator,
    deployment_id: &str,
    image: &str,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    ctx.logger
        .log(deployment_id, format!("Pushing image {image}"));
    let auth = ctx.settings.registry.auth();
    let mut stream = orchestrator.push_image(image, auth.as_ref()).await?;
    let mut table = PushProgressTable::new();
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            item = stream.next() => item,
        };
        match item {
            None => break,
            Some(Ok(progress)) => {
                if let Some(error) = progress.error {
                    return Err(WorkerError::Build(error));
                }
                if table.record(&progress) {
                    ctx.logger.live(deployment_id, table.render());
                }
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
    if !table.is_empty() {
        ctx.logger.log(deployment_id, table.render());
    }
    ctx.logger.log(deployment_id, "Image pushed");
    Ok(())
}
