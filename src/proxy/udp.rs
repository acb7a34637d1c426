use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ProxyError, UdpProxy};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Forward<'a> {
    port: u16,
    target_port: u16,
    service: &'a str,
}

#[derive(Debug, Deserialize)]
struct ForwardResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: String,
}

/// Client for the UDP forwarder running beside each proxy.
pub struct UdpProxyClient {
    base_url: String,
    restricted_ports: Vec<u16>,
    client: reqwest::Client,
}

impl UdpProxyClient {
    pub fn new(base_url: String, restricted_ports: Vec<u16>, client: reqwest::Client) -> Self {
        Self {
            base_url,
            restricted_ports,
            client,
        }
    }

    async fn call(&self, action: &str, forward: &Forward<'_>) -> Result<(), ProxyError> {
        let url = format!("{}/v1/proxy/{action}", self.base_url.trim_end_matches('/'));
        let response = self.client.post(url).json(forward).send().await?;
        if !response.status().is_success() {
            return Err(ProxyError::Udp(format!(
                "{action} {}:{} returned {}",
                forward.service,
                forward.port,
                response.status()
            )));
        }
        let body: ForwardResponse = response.json().await?;
        if !body.success {
            return Err(ProxyError::Udp(body.error));
        }
        Ok(())
    }
}

#[async_trait]
impl UdpProxy for UdpProxyClient {
    async fn add(&self, port: u16, target_port: u16, service: &str) -> Result<(), ProxyError> {
        if self.restricted_ports.contains(&port) {
            return Err(ProxyError::RestrictedPort(port));
        }
        self.call(
            "add",
            &Forward {
                port,
                target_port,
                service,
            },
        )
        .await
    }

    async fn remove(&self, port: u16, target_port: u16, service: &str) -> Result<(), ProxyError> {
        self.call(
            "remove",
            &Forward {
                port,
                target_port,
                service,
            },
        )
        .await
    }
}
