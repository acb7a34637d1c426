//! Git remote access for source builds, driven through the `git` CLI.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::model::{GitCredential, GitSource, GitTransport};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {command} failed: {stderr}")]
    Command { command: &'static str, stderr: String },
    #[error("branch {0} not found on remote")]
    BranchNotFound(String),
}

/// Remote a clone or ls-remote talks to, with the credentials it needs.
#[derive(Debug, Clone)]
pub struct GitRemote {
    pub url: String,
    pub transport: GitTransport,
    pub credential: Option<GitCredential>,
}

impl GitRemote {
    pub fn new(source: &GitSource, credential: Option<GitCredential>) -> Self {
        Self {
            url: source.repository_url(),
            transport: source.transport,
            credential,
        }
    }

    /// URL handed to git. Http remotes carry their basic credentials inline.
    fn authenticated_url(&self) -> String {
        let Some(credential) = &self.credential else {
            return self.url.clone();
        };
        if self.transport != GitTransport::Http || credential.username.is_empty() {
            return self.url.clone();
        }
        match self.url.split_once("://") {
            Some((scheme, rest)) => format!(
                "{scheme}://{}:{}@{rest}",
                urlencoding::encode(&credential.username),
                urlencoding::encode(&credential.password)
            ),
            None => self.url.clone(),
        }
    }

    fn redact(&self, text: &str) -> String {
        match &self.credential {
            Some(credential) if !credential.password.is_empty() => text
                .replace(&credential.password, "***")
                .replace(urlencoding::encode(&credential.password).as_ref(), "***"),
            _ => text.to_string(),
        }
    }
}

#[async_trait]
pub trait GitClient: Send + Sync {
    /// Commit the remote branch currently points at.
    async fn latest_commit(&self, remote: &GitRemote, branch: &str) -> Result<String, GitError>;
    /// Clones `branch` into `dest` and checks out `commit`.
    async fn clone_at(
        &self,
        remote: &GitRemote,
        branch: &str,
        commit: &str,
        dest: &Path,
    ) -> Result<(), GitError>;
}

#[derive(Debug, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(
        &self,
        remote: &GitRemote,
        command: &'static str,
        args: &[&str],
    ) -> Result<String, GitError> {
        // The key file has to outlive the child process.
        let key_file = match &remote.credential {
            Some(credential)
                if remote.transport == GitTransport::Ssh
                    && !credential.ssh_private_key.is_empty() =>
            {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(credential.ssh_private_key.as_bytes())?;
                if !credential.ssh_private_key.ends_with('\n') {
                    file.write_all(b"\n")?;
                }
                file.flush()?;
                Some(file)
            }
            _ => None,
        };

        let mut cmd = Command::new("git");
        cmd.arg(command)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key_file) = &key_file {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                    key_file.path().display()
                ),
            );
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::Command {
                command,
                stderr: remote.redact(stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// First commit hash in `git ls-remote` output.
fn parse_ls_remote(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|hash| !hash.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl GitClient for GitCli {
    async fn latest_commit(&self, remote: &GitRemote, branch: &str) -> Result<String, GitError> {
        let url = remote.authenticated_url();
        let reference = format!("refs/heads/{branch}");
        let output = self.run(remote, "ls-remote", &[&url, &reference]).await?;
        parse_ls_remote(&output).ok_or_else(|| GitError::BranchNotFound(branch.to_string()))
    }

    async fn clone_at(
        &self,
        remote: &GitRemote,
        branch: &str,
        commit: &str,
        dest: &Path,
    ) -> Result<(), GitError> {
        let url = remote.authenticated_url();
        let dest_str = dest.to_string_lossy();
        self.run(
            remote,
            "clone",
            &["--branch", branch, "--single-branch", &url, &dest_str],
        )
        .await?;
        self.run(
            remote,
            "-C",
            &[&dest_str, "-c", "advice.detachedHead=false", "checkout", commit],
        )
        .await?;
        log::debug!("Checked out {commit} of {}", remote.url);
        Ok(())
    }
}
