use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How the orchestrator schedules the tasks of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeploymentMode {
    Replicated { replicas: u32 },
    Global,
}

impl Default for DeploymentMode {
    fn default() -> Self {
        DeploymentMode::Replicated { replicas: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub volume: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    /// Also used as the orchestrated service name and the proxy backend name.
    pub name: String,
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
}

impl Application {
    /// Replica count the proxy backends should be sized for.
    ///
    /// Global services run one task per schedulable node, and a backend never
    /// drops below one server slot.
    pub fn backend_replicas(&self, schedulable_nodes: usize) -> u32 {
        let replicas = match self.deployment_mode {
            DeploymentMode::Replicated { replicas } => replicas,
            DeploymentMode::Global => u32::try_from(schedulable_nodes).unwrap_or(u32::MAX),
        };
        replicas.max(1)
    }

    /// Environment in the `KEY=VALUE` form the orchestrator expects.
    pub fn environment_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}
