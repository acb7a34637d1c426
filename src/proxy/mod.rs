//! Reverse proxy control: per-node clients and the multi-node transaction
//! protocol every routing and TLS change goes through.

mod haproxy;
mod locks;
mod transaction;
mod udp;

pub use haproxy::{DataPlaneClient, DataPlaneConnector, DataPlaneSettings};
pub use locks::{ProxyRoundLocks, RoundGuard};
pub use transaction::{ProxyMutation, ProxyNode, ProxyTransactionSet, RoundError};
pub use udp::UdpProxyClient;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{RedirectProtocol, Server};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("port {0} is restricted")]
    RestrictedPort(u16),
    #[error("port {port} already has a {existing} frontend")]
    ModeConflict { port: u16, existing: ListenerMode },
    #[error("frontend for port {0} cannot be created in tcp mode")]
    ReservedPort(u16),
    #[error("http listener on port {0} needs a domain")]
    MissingDomain(u16),
    #[error("invalid proxy response: {0}")]
    InvalidResponse(String),
    #[error("UDP proxy error: {0}")]
    Udp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    Http,
    Tcp,
}

impl AsRef<str> for ListenerMode {
    fn as_ref(&self) -> &str {
        match self {
            ListenerMode::Http => "http",
            ListenerMode::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Frontend a listener on `port` lives in.
pub fn frontend_name(mode: ListenerMode, port: u16) -> String {
    match (mode, port) {
        (ListenerMode::Http, 80) => "fe_http".to_string(),
        (ListenerMode::Http, 443) => "fe_https".to_string(),
        (mode, port) => format!("fe_{mode}_{port}"),
    }
}

/// Identity of a backend: one per (mode, service, target port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendKey {
    pub mode: ListenerMode,
    pub service: String,
    pub port: u16,
}

impl BackendKey {
    pub fn new(mode: ListenerMode, service: impl Into<String>, port: u16) -> Self {
        Self {
            mode,
            service: service.into(),
            port,
        }
    }

    pub fn name(&self) -> String {
        format!("be_{}_{}_{}", self.mode, self.service, self.port)
    }

    /// Prefix of the server template that resolves the service's tasks.
    pub fn server_prefix(&self) -> String {
        format!("{}_container-", self.service)
    }
}

/// One proxy node's control plane. Every mutation happens inside the
/// transaction named by `transaction_id` and is idempotent.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    async fn fetch_new_transaction(&self) -> Result<String, ProxyError>;
    async fn commit_transaction(&self, transaction_id: &str) -> Result<(), ProxyError>;
    async fn delete_transaction(&self, transaction_id: &str) -> Result<(), ProxyError>;

    async fn is_backend_exist(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<bool, ProxyError>;
    async fn add_backend(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
        replicas: u32,
    ) -> Result<(), ProxyError>;
    async fn remove_backend(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<(), ProxyError>;
    async fn get_replica_count(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<u32, ProxyError>;
    async fn update_backend_replicas(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
        replicas: u32,
    ) -> Result<(), ProxyError>;

    async fn add_http_link(
        &self,
        transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError>;
    async fn delete_http_link(
        &self,
        transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError>;
    async fn add_https_link(
        &self,
        transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError>;
    async fn delete_https_link(
        &self,
        transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError>;
    /// Binds `port` to the backend through a custom frontend. HTTP mode
    /// routes on the host header, so it needs a domain.
    async fn add_tcp_link(
        &self,
        transaction_id: &str,
        backend: &str,
        port: u16,
        domain: Option<&str>,
        mode: ListenerMode,
    ) -> Result<(), ProxyError>;
    async fn delete_tcp_link(
        &self,
        transaction_id: &str,
        backend: &str,
        port: u16,
        domain: Option<&str>,
        mode: ListenerMode,
    ) -> Result<(), ProxyError>;

    async fn add_redirect(
        &self,
        transaction_id: &str,
        protocol: RedirectProtocol,
        domain: &str,
        redirect_url: &str,
    ) -> Result<(), ProxyError>;
    async fn delete_redirect(
        &self,
        transaction_id: &str,
        protocol: RedirectProtocol,
        domain: &str,
    ) -> Result<(), ProxyError>;
    async fn enable_https_redirect(
        &self,
        transaction_id: &str,
        domain: &str,
    ) -> Result<(), ProxyError>;
    async fn disable_https_redirect(
        &self,
        transaction_id: &str,
        domain: &str,
    ) -> Result<(), ProxyError>;

    /// Uploads a certificate bundle for `domain`, replacing an existing one.
    async fn update_tls(
        &self,
        transaction_id: &str,
        domain: &str,
        private_key: &str,
        full_chain: &str,
    ) -> Result<(), ProxyError>;
}

/// Best effort UDP forwarding, outside any transaction.
#[async_trait]
pub trait UdpProxy: Send + Sync {
    async fn add(&self, port: u16, target_port: u16, service: &str) -> Result<(), ProxyError>;
    async fn remove(&self, port: u16, target_port: u16, service: &str) -> Result<(), ProxyError>;
}

/// Opens control clients for a proxy node.
pub trait ProxyConnector: Send + Sync {
    fn control(&self, server: &Server) -> Result<Arc<dyn ProxyControl>, ProxyError>;
    fn udp(&self, server: &Server) -> Result<Arc<dyn UdpProxy>, ProxyError>;
}
