use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    DeployPending,
    Live,
    Stopped,
    Failed,
    Stalled,
}

impl DeploymentStatus {
    /// Statuses no worker moves a deployment out of.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Stopped | DeploymentStatus::Failed | DeploymentStatus::Stalled
        )
    }
}

impl AsRef<str> for DeploymentStatus {
    fn as_ref(&self) -> &str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::DeployPending => "deploy_pending",
            DeploymentStatus::Live => "live",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Stalled => "stalled",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitTransport {
    Http,
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub transport: GitTransport,
    /// `https://github.com` for http remotes, `github.com` or `host:2222` for ssh.
    pub endpoint: String,
    #[serde(default)]
    pub owner: String,
    pub repository: String,
    pub branch: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub credential_id: Option<String>,
    /// Filled in by the build once the branch head has been resolved.
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub code_path: String,
}

fn default_ssh_user() -> String {
    "git".to_string()
}

impl GitSource {
    pub fn repository_url(&self) -> String {
        let path = if self.owner.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.owner, self.repository)
        };
        match self.transport {
            GitTransport::Http => format!("{}/{}", self.endpoint.trim_end_matches('/'), path),
            // An explicit port needs the url form of an ssh remote.
            GitTransport::Ssh if self.endpoint.contains(':') => {
                format!("ssh://{}@{}/{}", self.ssh_user, self.endpoint, path)
            }
            GitTransport::Ssh => format!("{}@{}:{}", self.ssh_user, self.endpoint, path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Upstream {
    Image {
        image: String,
        #[serde(default)]
        registry_credential_id: Option<String>,
    },
    Git(GitSource),
    SourceTarball {
        archive_name: String,
        #[serde(default)]
        code_path: String,
    },
}

impl Upstream {
    pub fn requires_build(&self) -> bool {
        !matches!(self, Upstream::Image { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Upstream::Image { .. } => "image",
            Upstream::Git(_) => "git",
            Upstream::SourceTarball { .. } => "source_tarball",
        }
    }

    /// The upstream as declared, without anything a build resolved later.
    fn declared(&self) -> Upstream {
        match self {
            Upstream::Git(git) => Upstream::Git(GitSource {
                commit_hash: None,
                ..git.clone()
            }),
            other => other.clone(),
        }
    }
}

/// The user controlled part of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub upstream: Upstream,
    #[serde(default)]
    pub dockerfile: String,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    pub spec: BuildSpec,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(id: impl Into<String>, application_id: impl Into<String>, spec: BuildSpec) -> Self {
        Self {
            id: id.into(),
            application_id: application_id.into(),
            spec,
            status: DeploymentStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Image reference the orchestrator should run.
    ///
    /// Built images are tagged `<app>:<deployment>` under the registry prefix,
    /// image upstreams are used verbatim.
    pub fn image_uri(&self, registry_prefix: &str) -> String {
        match &self.spec.upstream {
            Upstream::Image { image, .. } => image.clone(),
            Upstream::Git(_) | Upstream::SourceTarball { .. } => {
                let prefix = registry_prefix.trim_end_matches('/');
                if prefix.is_empty() {
                    format!("{}:{}", self.application_id, self.id)
                } else {
                    format!("{}/{}:{}", prefix, self.application_id, self.id)
                }
            }
        }
    }
}

/// One line of build or deploy output kept for history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentLog {
    pub deployment_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replacement {
    NoOp,
    CreateNew,
}

/// Decides whether a proposed spec supersedes the current ledger row.
///
/// Deployments are never edited; any difference in the declared source or
/// build inputs means a new row has to be appended.
pub fn decide_replacement(old: &BuildSpec, proposed: &BuildSpec) -> Replacement {
    if old.upstream.declared() == proposed.upstream.declared()
        && old.dockerfile == proposed.dockerfile
        && old.build_args == proposed.build_args
    {
        Replacement::NoOp
    } else {
        Replacement::CreateNew
    }
}
