//! Docker Swarm orchestrator using bollard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{
    Mount, MountTypeEnum, NetworkAttachmentConfig, ServiceSpec as SwarmServiceSpec,
    ServiceSpecMode, ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec,
    TaskSpecPlacement,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, InspectServiceOptions, PushImageOptionsBuilder,
    UpdateServiceOptionsBuilder,
};
use futures_util::StreamExt;

use super::{
    BuildProgress, ImageBuild, Orchestrator, OrchestratorConnector, OrchestratorError,
    ProgressStream, PushProgress, RegistryAuth, ServiceSpec, split_image_reference,
};
use crate::model::{DeploymentMode, Server};

const ROLLBACK_ATTEMPTS: usize = 5;
const ROLLBACK_RETRY_DELAY: Duration = Duration::from_secs(3);

pub struct DockerConnector {
    timeout_secs: u64,
}

impl DockerConnector {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

impl OrchestratorConnector for DockerConnector {
    fn connect(&self, server: &Server) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
        let docker = match server.docker_endpoint.as_deref() {
            None => Docker::connect_with_local_defaults()?,
            Some(endpoint) if endpoint.starts_with("unix://") || endpoint.starts_with('/') => {
                Docker::connect_with_socket(
                    endpoint.trim_start_matches("unix://"),
                    self.timeout_secs,
                    bollard::API_DEFAULT_VERSION,
                )?
            }
            Some(endpoint) => Docker::connect_with_http(
                endpoint,
                self.timeout_secs,
                bollard::API_DEFAULT_VERSION,
            )?,
        };
        Ok(Arc::new(DockerOrchestrator::new(docker)))
    }
}

pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    async fn inspect(&self, name: &str) -> Result<bollard::models::Service, OrchestratorError> {
        match self
            .docker
            .inspect_service(name, None::<InspectServiceOptions>)
            .await
        {
            Ok(service) => Ok(service),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(OrchestratorError::ServiceNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_with_spec(
        &self,
        name: &str,
        spec: SwarmServiceSpec,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), OrchestratorError> {
        let current = self.inspect(name).await?;
        let version = current
            .version
            .and_then(|v| v.index)
            .and_then(|index| i32::try_from(index).ok())
            .unwrap_or_default();
        let options = UpdateServiceOptionsBuilder::new()
            .version(version)
            .build();
        self.docker
            .update_service(name, spec, options, credentials)
            .await?;
        Ok(())
    }
}

fn credentials(auth: Option<&RegistryAuth>) -> Option<DockerCredentials> {
    auth.map(|auth| DockerCredentials {
        username: Some(auth.username.clone()),
        password: Some(auth.password.clone()),
        serveraddress: Some(auth.server.clone()),
        ..Default::default()
    })
}

fn swarm_spec(spec: &ServiceSpec) -> SwarmServiceSpec {
    let mounts = spec
        .volumes
        .iter()
        .map(|volume| Mount {
            source: Some(volume.volume.clone()),
            target: Some(volume.mount_path.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(volume.read_only),
            ..Default::default()
        })
        .collect();
    let networks = spec
        .networks
        .iter()
        .map(|network| NetworkAttachmentConfig {
            target: Some(network.clone()),
            ..Default::default()
        })
        .collect();
    let mode = match spec.mode {
        DeploymentMode::Replicated { replicas } => ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(i64::from(replicas)),
            }),
            ..Default::default()
        },
        DeploymentMode::Global => ServiceSpecMode {
            global: Some(Default::default()),
            ..Default::default()
        },
    };
    SwarmServiceSpec {
        name: Some(spec.name.clone()),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(spec.image.clone()),
                command: (!spec.command.is_empty()).then(|| spec.command.clone()),
                env: Some(spec.env.clone()),
                mounts: Some(mounts),
                capability_add: (!spec.capabilities.is_empty())
                    .then(|| spec.capabilities.clone()),
                sysctls: (!spec.sysctls.is_empty())
                    .then(|| spec.sysctls.clone().into_iter().collect::<HashMap<_, _>>()),
                ..Default::default()
            }),
            placement: Some(TaskSpecPlacement {
                constraints: Some(spec.placement_constraints.clone()),
                ..Default::default()
            }),
            networks: Some(networks),
            ..Default::default()
        }),
        mode: Some(mode),
        ..Default::default()
    }
}

/// Packs a build context with the system `tar`, the same way the engine CLI
/// streams it.
async fn pack_context(build: &ImageBuild) -> Result<bytes::Bytes, OrchestratorError> {
    let output = tokio::process::Command::new("tar")
        .arg("-C")
        .arg(&build.context_dir)
        .args(["-cf", "-", "."])
        .output()
        .await?;
    if !output.status.success() {
        return Err(OrchestratorError::Context(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(bytes::Bytes::from(output.stdout))
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn service_exists(&self, name: &str) -> Result<bool, OrchestratorError> {
        match self.inspect(name).await {
            Ok(_) => Ok(true),
            Err(OrchestratorError::ServiceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_service(
        &self,
        spec: &ServiceSpec,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError> {
        log::info!("Creating service {} with image {}", spec.name, spec.image);
        self.docker
            .create_service(swarm_spec(spec), credentials(auth))
            .await
            .inspect_err(|e| log::error!("Failed to create service {}: {e}", spec.name))?;
        Ok(())
    }

    async fn update_service(
        &self,
        spec: &ServiceSpec,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError> {
        log::info!("Updating service {} to image {}", spec.name, spec.image);
        self.update_with_spec(&spec.name, swarm_spec(spec), credentials(auth))
            .await
            .inspect_err(|e| log::error!("Failed to update service {}: {e}", spec.name))
    }

    async fn rollback_service(&self, name: &str) -> Result<(), OrchestratorError> {
        let mut last_error = None;
        for attempt in 1..=ROLLBACK_ATTEMPTS {
            let previous = self
                .inspect(name)
                .await?
                .previous_spec
                .ok_or_else(|| OrchestratorError::NoPreviousSpec(name.to_string()))?;
            match self.update_with_spec(name, previous, None).await {
                Ok(()) => {
                    log::info!("Rolled back service {name}");
                    return Ok(());
                }
                // A concurrent update bumps the version under us.
                Err(e) if e.to_string().contains("update out of sequence") => {
                    log::warn!("Rollback of {name} out of sequence (attempt {attempt}), retrying");
                    last_error = Some(e);
                    tokio::time::sleep(ROLLBACK_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| OrchestratorError::NoPreviousSpec(name.to_string())))
    }

    async fn remove_service(&self, name: &str) -> Result<(), OrchestratorError> {
        match self.docker.delete_service(name).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(
        &self,
        build: ImageBuild,
    ) -> Result<ProgressStream<BuildProgress>, OrchestratorError> {
        let context = pack_context(&build).await?;
        let build_args: HashMap<String, String> = build.build_args.clone().into_iter().collect();
        let options = BuildImageOptionsBuilder::new()
            .dockerfile(&build.dockerfile)
            .t(&build.tag)
            .buildargs(&build_args)
            .rm(true)
            .forcerm(true)
            .build();
        let stream = self
            .docker
            .build_image(options, None, Some(bollard::body_full(context)))
            .filter_map(|item| async move {
                match item {
                    Ok(info) => serde_json::to_value(&info)
                        .ok()
                        .as_ref()
                        .and_then(BuildProgress::from_json)
                        .map(Ok),
                    Err(e) => Some(Err(OrchestratorError::from(e))),
                }
            });
        Ok(stream.boxed())
    }

    async fn push_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<ProgressStream<PushProgress>, OrchestratorError> {
        let (repository, tag) = split_image_reference(image);
        let options = PushImageOptionsBuilder::new().tag(tag).build();
        let stream = self
            .docker
            .push_image(repository, Some(options), credentials(auth))
            .map(|item| match item {
                // Field names differ across engine API versions, the JSON
                // shape does not.
                Ok(info) => Ok(serde_json::to_value(&info)
                    .map(|value| PushProgress::from_json(&value))
                    .unwrap_or_default()),
                Err(e) => Err(OrchestratorError::from(e)),
            });
        Ok(stream.boxed())
    }
}
