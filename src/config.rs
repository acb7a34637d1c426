use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use cron::Schedule;
use minijinja::Environment;
use serde::{Deserialize, Serialize};

use crate::logs::LogSettings;
use crate::proxy::DataPlaneSettings;
use crate::queue::QueueSettings;
use crate::tls::AcmeSettings;
use crate::worker::{RegistrySettings, WorkerSettings};

/// Daily at 03:00 UTC.
const DEFAULT_RENEWAL_CRON: &str = "0 0 3 * * *";
/// Every 20 minutes.
const DEFAULT_PROXY_SYNC_CRON: &str = "0 */20 * * * *";

#[derive(Debug, Default)]
pub struct ConfigVars {
    inner: HashMap<String, String>,
}

impl<'de> Deserialize<'de> for ConfigVars {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = HashMap::deserialize(deserializer)?;
        Ok(Self { inner })
    }
}

impl Serialize for ConfigVars {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.serialize(serializer)
    }
}

impl ConfigVars {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    fn try_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(vars) => Self::try_init_from_string(&vars),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error: {0:?}")]
    Template(#[from] minijinja::Error),
    #[error("Invalid cron expression: {0}")]
    Cron(#[from] cron::error::Error),
    #[error("Missing setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Deserialize)]
pub struct WharfConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Where the entity store persists its snapshot. Kept in memory only
    /// when unset.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_swarm_network")]
    pub swarm_network: String,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub logs: LogSettings,
    #[serde(default)]
    pub proxy: DataPlaneSettings,
    /// When settled rules and certificates are pushed to every proxy again.
    #[serde(default)]
    pub proxy_sync_cron: Option<Schedule>,
    #[serde(default)]
    pub ssl: SslSettings,
    #[serde(default)]
    pub docker: DockerSettings,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wharf")
}

fn default_swarm_network() -> String {
    "wharf".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslSettings {
    /// ACME account contact. Required unless `simulate` is set.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub directory_url: Option<String>,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,
    #[serde(default)]
    pub renewal_cron: Option<Schedule>,
    #[serde(default = "default_challenge_addr")]
    pub challenge_addr: SocketAddr,
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,
    /// Issue self-signed certificates instead of talking to an ACME server.
    #[serde(default)]
    pub simulate: bool,
}

fn default_poll_timeout() -> u64 {
    90
}

fn default_renew_before_days() -> i64 {
    15
}

fn default_challenge_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8089))
}

fn default_verify_timeout() -> u64 {
    10
}

impl Default for SslSettings {
    fn default() -> Self {
        Self {
            email: None,
            directory_url: None,
            poll_timeout_secs: default_poll_timeout(),
            renew_before_days: default_renew_before_days(),
            renewal_cron: None,
            challenge_addr: default_challenge_addr(),
            verify_timeout_secs: default_verify_timeout(),
            simulate: false,
        }
    }
}

impl SslSettings {
    pub fn renewal_schedule(&self) -> Result<Schedule, ConfigError> {
        match &self.renewal_cron {
            Some(schedule) => Ok(schedule.clone()),
            None => Ok(Schedule::from_str(DEFAULT_RENEWAL_CRON)?),
        }
    }

    pub fn acme(&self) -> Result<AcmeSettings, ConfigError> {
        let email = self.email.clone().ok_or(ConfigError::Missing("ssl.email"))?;
        Ok(AcmeSettings {
            email,
            directory_url: self.directory_url.clone(),
            poll_timeout_secs: self.poll_timeout_secs,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerSettings {
    #[serde(default = "default_docker_timeout")]
    pub timeout_secs: u64,
}

fn default_docker_timeout() -> u64 {
    120
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_docker_timeout(),
        }
    }
}

impl WharfConfig {
    fn try_init_from_string(config: &str, vars: &ConfigVars) -> Result<Self, ConfigError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        let template = env.template_from_str(config)?;
        let rendered = template.render(vars)?;

        Ok(toml::from_str(&rendered)?)
    }

    pub fn try_init() -> Result<Self, ConfigError> {
        let args = crate::cli::get_cli_args();
        let config = std::fs::read_to_string(&args.config)?;
        let vars = ConfigVars::try_init(&args.vars)?;

        let mut config = Self::try_init_from_string(&config, &vars)?;
        if args.simulate {
            config.ssl.simulate = true;
        }
        Ok(config)
    }

    pub fn proxy_sync_schedule(&self) -> Result<Schedule, ConfigError> {
        match &self.proxy_sync_cron {
            Some(schedule) => Ok(schedule.clone()),
            None => Ok(Schedule::from_str(DEFAULT_PROXY_SYNC_CRON)?),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            data_dir: self.data_dir.clone(),
            swarm_network: self.swarm_network.clone(),
            registry: self.registry.clone(),
            renew_before_days: self.ssl.renew_before_days,
        }
    }
}
