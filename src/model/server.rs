use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmRole {
    Manager,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyRole {
    Active,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub role: ProxyRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub swarm_role: SwarmRole,
    pub status: ServerStatus,
    #[serde(default = "default_schedule_deployments")]
    pub schedule_deployments: bool,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Docker API address, local socket when absent.
    #[serde(default)]
    pub docker_endpoint: Option<String>,
}

fn default_schedule_deployments() -> bool {
    true
}

impl Server {
    pub fn is_online(&self) -> bool {
        self.status == ServerStatus::Online
    }

    pub fn is_swarm_manager(&self) -> bool {
        self.is_online() && self.swarm_role == SwarmRole::Manager
    }

    /// Whether this node takes part in proxy reconciliation rounds.
    pub fn is_active_proxy(&self) -> bool {
        self.is_online()
            && matches!(
                self.proxy,
                Some(ProxyConfig {
                    enabled: true,
                    role: ProxyRole::Active
                })
            )
    }
}
