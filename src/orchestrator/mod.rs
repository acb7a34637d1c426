//! Container orchestrator boundary: image builds, pushes and service upserts.

mod docker;

pub use docker::{DockerConnector, DockerOrchestrator};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::model::{DeploymentMode, Server, VolumeBinding};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("service {0} not found")]
    ServiceNotFound(String),
    #[error("service {0} has no previous spec to roll back to")]
    NoPreviousSpec(String),
    #[error("could not pack build context: {0}")]
    Context(String),
}

/// Desired state of one orchestrated service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub networks: Vec<String>,
    pub mode: DeploymentMode,
    pub volumes: Vec<VolumeBinding>,
    pub capabilities: Vec<String>,
    pub sysctls: BTreeMap<String, String>,
    pub placement_constraints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ImageBuild {
    /// Directory sent to the builder as the build context.
    pub context_dir: PathBuf,
    /// Dockerfile path relative to the context.
    pub dockerfile: String,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
}

/// One record of builder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildProgress {
    Output(String),
    Error(String),
}

impl BuildProgress {
    /// Reads a builder record in the engine's JSON shape. Records carrying
    /// neither output nor an error (aux, status) yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        if let Some(error) = value
            .get("error")
            .and_then(|e| e.as_str())
            .or_else(|| value.pointer("/errorDetail/message").and_then(|e| e.as_str()))
        {
            return Some(BuildProgress::Error(error.to_string()));
        }
        value
            .get("stream")
            .and_then(|s| s.as_str())
            .map(|s| BuildProgress::Output(s.to_string()))
    }
}

/// One record of registry push output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushProgress {
    pub id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
}

impl PushProgress {
    pub fn from_json(value: &serde_json::Value) -> Self {
        let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(str::to_string);
        Self {
            id: field("id"),
            status: field("status"),
            progress: field("progress"),
            error: field("error").or_else(|| {
                value
                    .pointer("/errorDetail/message")
                    .and_then(|e| e.as_str())
                    .map(str::to_string)
            }),
        }
    }
}

pub type ProgressStream<T> = BoxStream<'static, Result<T, OrchestratorError>>;

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn service_exists(&self, name: &str) -> Result<bool, OrchestratorError>;
    async fn create_service(
        &self,
        spec: &ServiceSpec,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError>;
    async fn update_service(
        &self,
        spec: &ServiceSpec,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError>;
    /// Restores the spec the service ran before its last update.
    async fn rollback_service(&self, name: &str) -> Result<(), OrchestratorError>;
    async fn remove_service(&self, name: &str) -> Result<(), OrchestratorError>;
    async fn build_image(
        &self,
        build: ImageBuild,
    ) -> Result<ProgressStream<BuildProgress>, OrchestratorError>;
    async fn push_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<ProgressStream<PushProgress>, OrchestratorError>;
}

/// Opens an orchestrator client for a swarm manager node.
pub trait OrchestratorConnector: Send + Sync {
    fn connect(&self, server: &Server) -> Result<Arc<dyn Orchestrator>, OrchestratorError>;
}

/// Splits `repo[:tag]` into repository and tag, treating a colon followed by
/// a path as a registry port.
pub fn split_image_reference(image: &str) -> (&str, &str) {
    if let Some(at_pos) = image.find('@') {
        return (&image[..at_pos], &image[at_pos + 1..]);
    }
    if let Some(colon_pos) = image.rfind(':') {
        let after_colon = &image[colon_pos + 1..];
        if !after_colon.contains('/') {
            return (&image[..colon_pos], after_colon);
        }
    }
    (image, "latest")
}

/// Registry host of an image reference, Docker Hub when it has none.
pub fn registry_host(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => "docker.io",
    }
}
