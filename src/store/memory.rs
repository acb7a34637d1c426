use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::{EntityStore, Promotion, StoreError};
use crate::model::{
    Application, Deployment, DeploymentLog, DeploymentStatus, Domain, GitCredential, IngressRule,
    RedirectRule, RegistryCredential, RuleStatus, Server, TlsStatus,
};

/// Lines of history kept per deployment.
const MAX_LOG_LINES: usize = 10_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    applications: BTreeMap<String, Application>,
    #[serde(default)]
    deployments: BTreeMap<String, Deployment>,
    #[serde(default)]
    ingress_rules: BTreeMap<String, IngressRule>,
    #[serde(default)]
    redirect_rules: BTreeMap<String, RedirectRule>,
    #[serde(default)]
    domains: BTreeMap<String, Domain>,
    #[serde(default)]
    servers: BTreeMap<String, Server>,
    #[serde(default)]
    git_credentials: BTreeMap<String, GitCredential>,
    #[serde(default)]
    registry_credentials: BTreeMap<String, RegistryCredential>,
}

/// In-process store, optionally mirrored to a JSON snapshot after every
/// mutation so state survives restarts.
///
/// Deployment logs stay out of the snapshot. With a snapshot they are
/// appended to one JSON-lines file per deployment next to it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    logs: RwLock<BTreeMap<String, VecDeque<DeploymentLog>>>,
    snapshot: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    /// Serializes mutations so each one starts from the last saved state.
    mutation_lock: tokio::sync::Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the snapshot at `path`, starting empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No state snapshot at {}, starting empty", path.display());
                State::default()
            }
            Err(e) => return Err(e.into()),
        };
        let log_dir = path.with_extension("logs");
        tokio::fs::create_dir_all(&log_dir).await?;
        Ok(Self {
            state: RwLock::new(state),
            logs: RwLock::default(),
            snapshot: Some(path),
            log_dir: Some(log_dir),
            mutation_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    /// Applies `f` to a copy of the state, saves the copy, and only then
    /// makes it visible. A failed save leaves the visible state untouched.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut State) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.mutation_lock.lock().await;
        let mut next = self.read()?.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.snapshot {
            save_snapshot(path, &next).await?;
        }
        *self.state.write().map_err(|_| StoreError::Poisoned)? = next;
        Ok(out)
    }

    pub async fn insert_application(&self, application: Application) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .applications
                .insert(application.id.clone(), application);
            Ok(())
        })
        .await
    }

    pub async fn insert_ingress_rule(&self, rule: IngressRule) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.ingress_rules.insert(rule.id.clone(), rule);
            Ok(())
        })
        .await
    }

    pub async fn insert_redirect_rule(&self, rule: RedirectRule) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.redirect_rules.insert(rule.id.clone(), rule);
            Ok(())
        })
        .await
    }

    pub async fn insert_domain(&self, domain: Domain) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.domains.insert(domain.id.clone(), domain);
            Ok(())
        })
        .await
    }

    pub async fn insert_server(&self, server: Server) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.servers.insert(server.id.clone(), server);
            Ok(())
        })
        .await
    }

    pub async fn insert_git_credential(&self, credential: GitCredential) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .git_credentials
                .insert(credential.id.clone(), credential);
            Ok(())
        })
        .await
    }

    pub async fn insert_registry_credential(
        &self,
        credential: RegistryCredential,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .registry_credentials
                .insert(credential.id.clone(), credential);
            Ok(())
        })
        .await
    }

    fn log_file(dir: &Path, deployment_id: &str) -> PathBuf {
        // Ids are uuids; encoding keeps anything else inside `dir`.
        let name = urlencoding::encode(deployment_id).replace('.', "%2E");
        dir.join(format!("{name}.jsonl"))
    }

    async fn append_log_files(
        dir: &Path,
        logs: &BTreeMap<&str, Vec<&DeploymentLog>>,
    ) -> Result<(), StoreError> {
        for (deployment_id, lines) in logs {
            let mut content = Vec::new();
            for line in lines {
                serde_json::to_writer(&mut content, line)?;
                content.push(b'\n');
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(Self::log_file(dir, deployment_id))
                .await?;
            file.write_all(&content).await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn read_log_file(
        dir: &Path,
        deployment_id: &str,
    ) -> Result<Vec<DeploymentLog>, StoreError> {
        let content = match tokio::fs::read_to_string(Self::log_file(dir, deployment_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = VecDeque::new();
        for line in content.lines().filter(|line| !line.is_empty()) {
            lines.push_back(serde_json::from_str(line)?);
            if lines.len() > MAX_LOG_LINES {
                lines.pop_front();
            }
        }
        Ok(lines.into())
    }
}

async fn save_snapshot(path: &Path, state: &State) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn deployment_mut<'a>(
    state: &'a mut State,
    id: &str,
) -> Result<&'a mut Deployment, StoreError> {
    state
        .deployments
        .get_mut(id)
        .ok_or_else(|| StoreError::not_found("deployment", id))
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError> {
        Ok(self.read()?.applications.get(id).cloned())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
        Ok(self.read()?.applications.values().cloned().collect())
    }

    async fn delete_application(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.applications.remove(id);
            state.deployments.retain(|_, d| d.application_id != id);
            state.ingress_rules.retain(|_, rule| rule.application_id != id);
            Ok(())
        })
        .await
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
        Ok(self.read()?.deployments.get(id).cloned())
    }

    async fn latest_deployment(&self, app_id: &str) -> Result<Option<Deployment>, StoreError> {
        Ok(self
            .read()?
            .deployments
            .values()
            .filter(|d| d.application_id == app_id)
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .cloned())
    }

    async fn list_deployments(&self, app_id: &str) -> Result<Vec<Deployment>, StoreError> {
        let mut deployments: Vec<_> = self
            .read()?
            .deployments
            .values()
            .filter(|d| d.application_id == app_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(deployments)
    }

    async fn deployments_with_status(
        &self,
        status: DeploymentStatus,
    ) -> Result<Vec<Deployment>, StoreError> {
        Ok(self
            .read()?
            .deployments
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect())
    }

    async fn insert_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.deployments.insert(deployment.id.clone(), deployment);
            Ok(())
        })
        .await
    }

    async fn update_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            deployment_mut(state, id)?.status = status;
            Ok(())
        })
        .await
    }

    async fn set_commit_hash(&self, id: &str, commit_hash: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            if let crate::model::Upstream::Git(git) = &mut deployment_mut(state, id)?.spec.upstream
            {
                git.commit_hash = Some(commit_hash.to_string());
            }
            Ok(())
        })
        .await
    }

    async fn promote_to_live(
        &self,
        app_id: &str,
        deployment_id: &str,
    ) -> Result<Promotion, StoreError> {
        self.mutate(|state| {
            let target = deployment_mut(state, deployment_id)?;
            if target.application_id != app_id {
                return Err(StoreError::Mismatch {
                    application: app_id.to_string(),
                    deployment: deployment_id.to_string(),
                });
            }
            let position = (target.created_at, target.id.clone());
            if target.status == DeploymentStatus::DeployPending {
                let newer = state
                    .deployments
                    .values()
                    .filter(|d| d.application_id == app_id && !d.status.is_terminal())
                    .filter(|d| (d.created_at, &d.id) > (position.0, &position.1))
                    .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
                    .map(|d| d.id.clone());
                if let Some(by) = newer {
                    deployment_mut(state, deployment_id)?.status = DeploymentStatus::Stalled;
                    return Ok(Promotion::Superseded { by });
                }
            }
            let mut stalled = None;
            for deployment in state.deployments.values_mut() {
                if deployment.application_id != app_id {
                    continue;
                }
                if deployment.id == deployment_id {
                    deployment.status = DeploymentStatus::Live;
                } else if deployment.status == DeploymentStatus::Live {
                    deployment.status = DeploymentStatus::Stalled;
                    stalled = Some(deployment.id.clone());
                }
            }
            Ok(Promotion::Live { stalled })
        })
        .await
    }

    async fn get_ingress_rule(&self, id: &str) -> Result<Option<IngressRule>, StoreError> {
        Ok(self.read()?.ingress_rules.get(id).cloned())
    }

    async fn list_ingress_rules(&self) -> Result<Vec<IngressRule>, StoreError> {
        Ok(self.read()?.ingress_rules.values().cloned().collect())
    }

    async fn ingress_rules_for_application(
        &self,
        app_id: &str,
    ) -> Result<Vec<IngressRule>, StoreError> {
        Ok(self
            .read()?
            .ingress_rules
            .values()
            .filter(|rule| rule.application_id == app_id)
            .cloned()
            .collect())
    }

    async fn update_ingress_rule_status(
        &self,
        id: &str,
        status: RuleStatus,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .ingress_rules
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found("ingress rule", id))?
                .status = status;
            Ok(())
        })
        .await
    }

    async fn set_https_redirect(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .ingress_rules
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found("ingress rule", id))?
                .https_redirect = enabled;
            Ok(())
        })
        .await
    }

    async fn delete_ingress_rule(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.ingress_rules.remove(id);
            Ok(())
        })
        .await
    }

    async fn get_redirect_rule(&self, id: &str) -> Result<Option<RedirectRule>, StoreError> {
        Ok(self.read()?.redirect_rules.get(id).cloned())
    }

    async fn list_redirect_rules(&self) -> Result<Vec<RedirectRule>, StoreError> {
        Ok(self.read()?.redirect_rules.values().cloned().collect())
    }

    async fn update_redirect_rule_status(
        &self,
        id: &str,
        status: RuleStatus,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .redirect_rules
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found("redirect rule", id))?
                .status = status;
            Ok(())
        })
        .await
    }

    async fn delete_redirect_rule(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.redirect_rules.remove(id);
            Ok(())
        })
        .await
    }

    async fn get_domain(&self, id: &str) -> Result<Option<Domain>, StoreError> {
        Ok(self.read()?.domains.get(id).cloned())
    }

    async fn list_domains(&self) -> Result<Vec<Domain>, StoreError> {
        Ok(self.read()?.domains.values().cloned().collect())
    }

    async fn update_domain(&self, domain: Domain) -> Result<(), StoreError> {
        self.mutate(|state| {
            let slot = state
                .domains
                .get_mut(&domain.id)
                .ok_or_else(|| StoreError::not_found("domain", domain.id.clone()))?;
            *slot = domain;
            Ok(())
        })
        .await
    }

    async fn update_tls_status(&self, id: &str, status: TlsStatus) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .domains
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found("domain", id))?
                .tls_status = status;
            Ok(())
        })
        .await
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        Ok(self.read()?.servers.values().cloned().collect())
    }

    async fn set_server_schedule(&self, id: &str, schedule: bool) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .servers
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found("server", id))?
                .schedule_deployments = schedule;
            Ok(())
        })
        .await
    }

    async fn get_git_credential(&self, id: &str) -> Result<Option<GitCredential>, StoreError> {
        Ok(self.read()?.git_credentials.get(id).cloned())
    }

    async fn get_registry_credential(
        &self,
        id: &str,
    ) -> Result<Option<RegistryCredential>, StoreError> {
        Ok(self.read()?.registry_credentials.get(id).cloned())
    }

    async fn append_deployment_logs(&self, logs: Vec<DeploymentLog>) -> Result<(), StoreError> {
        if let Some(dir) = &self.log_dir {
            let mut by_deployment: BTreeMap<&str, Vec<&DeploymentLog>> = BTreeMap::new();
            for line in &logs {
                by_deployment
                    .entry(line.deployment_id.as_str())
                    .or_default()
                    .push(line);
            }
            return Self::append_log_files(dir, &by_deployment).await;
        }
        let mut history = self.logs.write().map_err(|_| StoreError::Poisoned)?;
        for line in logs {
            let lines = history.entry(line.deployment_id.clone()).or_default();
            lines.push_back(line);
            if lines.len() > MAX_LOG_LINES {
                lines.pop_front();
            }
        }
        Ok(())
    }

    async fn deployment_logs(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<DeploymentLog>, StoreError> {
        if let Some(dir) = &self.log_dir {
            return Self::read_log_file(dir, deployment_id).await;
        }
        Ok(self
            .logs
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(deployment_id)
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildSpec, Upstream};

    fn deployment(id: &str, app: &str, status: DeploymentStatus) -> Deployment {
        let mut deployment = Deployment::new(
            id,
            app,
            BuildSpec {
                upstream: Upstream::Image {
                    image: "nginx".into(),
                    registry_credential_id: None,
                },
                dockerfile: String::new(),
                build_args: Default::default(),
            },
        );
        deployment.status = status;
        deployment
    }

    #[tokio::test]
    async fn test_promote_to_live_stalls_previous() {
        let store = MemoryStore::new();
        store
            .insert_deployment(deployment("d1", "web", DeploymentStatus::Live))
            .await
            .unwrap();
        store
            .insert_deployment(deployment("d2", "web", DeploymentStatus::DeployPending))
            .await
            .unwrap();
        store
            .insert_deployment(deployment("o1", "other", DeploymentStatus::Live))
            .await
            .unwrap();

        let promotion = store.promote_to_live("web", "d2").await.unwrap();
        assert_eq!(
            promotion,
            Promotion::Live {
                stalled: Some("d1".into())
            }
        );

        let d1 = store.get_deployment("d1").await.unwrap().unwrap();
        let d2 = store.get_deployment("d2").await.unwrap().unwrap();
        let o1 = store.get_deployment("o1").await.unwrap().unwrap();
        assert_eq!(d1.status, DeploymentStatus::Stalled);
        assert_eq!(d2.status, DeploymentStatus::Live);
        assert_eq!(o1.status, DeploymentStatus::Live);
    }

    #[tokio::test]
    async fn test_promote_of_older_deployment_is_superseded() {
        let store = MemoryStore::new();
        store
            .insert_deployment(deployment("d1", "web", DeploymentStatus::DeployPending))
            .await
            .unwrap();
        store
            .insert_deployment(deployment("d2", "web", DeploymentStatus::Live))
            .await
            .unwrap();

        let promotion = store.promote_to_live("web", "d1").await.unwrap();
        assert_eq!(promotion, Promotion::Superseded { by: "d2".into() });
        let d1 = store.get_deployment("d1").await.unwrap().unwrap();
        let d2 = store.get_deployment("d2").await.unwrap().unwrap();
        assert_eq!(d1.status, DeploymentStatus::Stalled);
        assert_eq!(d2.status, DeploymentStatus::Live);
    }

    #[tokio::test]
    async fn test_promote_ignores_newer_failed_deployment() {
        let store = MemoryStore::new();
        store
            .insert_deployment(deployment("d1", "web", DeploymentStatus::DeployPending))
            .await
            .unwrap();
        store
            .insert_deployment(deployment("d2", "web", DeploymentStatus::Failed))
            .await
            .unwrap();
        assert_eq!(
            store.promote_to_live("web", "d1").await.unwrap(),
            Promotion::Live { stalled: None }
        );
    }

    #[tokio::test]
    async fn test_promote_rejects_foreign_deployment() {
        let store = MemoryStore::new();
        store
            .insert_deployment(deployment("o1", "other", DeploymentStatus::DeployPending))
            .await
            .unwrap();
        let err = store.promote_to_live("web", "o1").await.unwrap_err();
        assert!(matches!(err, StoreError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_promote_twice_keeps_single_live() {
        let store = MemoryStore::new();
        store
            .insert_deployment(deployment("d1", "web", DeploymentStatus::DeployPending))
            .await
            .unwrap();
        for _ in 0..2 {
            assert_eq!(
                store.promote_to_live("web", "d1").await.unwrap(),
                Promotion::Live { stalled: None }
            );
        }
        let live = store
            .deployments_with_status(DeploymentStatus::Live)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = MemoryStore::open(&path).await.unwrap();
        store
            .insert_deployment(deployment("d1", "web", DeploymentStatus::Pending))
            .await
            .unwrap();
        store
            .update_deployment_status("d1", DeploymentStatus::Failed)
            .await
            .unwrap();
        drop(store);

        let reopened = MemoryStore::open(&path).await.unwrap();
        let d1 = reopened.get_deployment("d1").await.unwrap().unwrap();
        assert_eq!(d1.status, DeploymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_ingress_rule_status("missing", RuleStatus::Applied)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "ingress rule", .. }));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("state.json")).await.unwrap();
        store
            .insert_deployment(deployment("d1", "web", DeploymentStatus::Pending))
            .await
            .unwrap();

        // Nowhere left to write the snapshot.
        dir.close().unwrap();
        let err = store
            .update_deployment_status("d1", DeploymentStatus::DeployPending)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        let d1 = store.get_deployment("d1").await.unwrap().unwrap();
        assert_eq!(d1.status, DeploymentStatus::Pending);
    }

    fn log_line(deployment_id: &str, content: &str) -> DeploymentLog {
        DeploymentLog {
            deployment_id: deployment_id.into(),
            content: content.into(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_logs_kept_out_of_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = MemoryStore::open(&path).await.unwrap();
        store
            .insert_deployment(deployment("d1", "web", DeploymentStatus::Pending))
            .await
            .unwrap();
        store
            .append_deployment_logs(vec![log_line("d1", "Cloning"), log_line("d2", "Pulling")])
            .await
            .unwrap();
        store
            .append_deployment_logs(vec![log_line("d1", "Building")])
            .await
            .unwrap();

        let snapshot = std::fs::read_to_string(&path).unwrap();
        assert!(!snapshot.contains("Cloning"));
        drop(store);

        let reopened = MemoryStore::open(&path).await.unwrap();
        let lines: Vec<_> = reopened
            .deployment_logs("d1")
            .await
            .unwrap()
            .into_iter()
            .map(|line| line.content)
            .collect();
        assert_eq!(lines, vec!["Cloning", "Building"]);
        assert_eq!(reopened.deployment_logs("d2").await.unwrap().len(), 1);
        assert!(reopened.deployment_logs("d3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_history_is_capped() {
        let store = MemoryStore::new();
        let lines = (0..MAX_LOG_LINES + 5)
            .map(|n| log_line("d1", &n.to_string()))
            .collect();
        store.append_deployment_logs(lines).await.unwrap();
        let kept = store.deployment_logs("d1").await.unwrap();
        assert_eq!(kept.len(), MAX_LOG_LINES);
        assert_eq!(kept[0].content, "5");
    }

    #[test]
    fn test_log_file_stays_in_dir() {
        let dir = Path::new("/var/lib/wharf/state.logs");
        let file = MemoryStore::log_file(dir, "../../etc/passwd");
        assert_eq!(file.parent(), Some(dir));
    }
}
