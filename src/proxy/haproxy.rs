//! HAProxy Data Plane API client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    BackendKey, ListenerMode, ProxyConnector, ProxyControl, ProxyError, UdpProxy, UdpProxyClient,
    frontend_name,
};
use crate::model::{RedirectProtocol, Server};

const DEFAULT_BACKEND: &str = "error_backend";
const FRONTEND_MAXCONN: u32 = 6000;

#[derive(Debug, Clone, Deserialize)]
pub struct DataPlaneSettings {
    #[serde(default = "default_data_plane_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Ports no custom frontend or UDP forward may bind.
    #[serde(default)]
    pub restricted_ports: Vec<u16>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_data_plane_port() -> u16 {
    5555
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_udp_port() -> u16 {
    3333
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for DataPlaneSettings {
    fn default() -> Self {
        Self {
            port: default_data_plane_port(),
            username: default_username(),
            password: String::new(),
            udp_port: default_udp_port(),
            restricted_ports: Vec::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Connects to the Data Plane API and UDP forwarder on each proxy node.
pub struct DataPlaneConnector {
    settings: DataPlaneSettings,
    client: reqwest::Client,
}

impl DataPlaneConnector {
    pub fn new(settings: DataPlaneSettings) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self { settings, client })
    }
}

impl ProxyConnector for DataPlaneConnector {
    fn control(&self, server: &Server) -> Result<Arc<dyn ProxyControl>, ProxyError> {
        let base_url = format!("http://{}:{}/v2", server.ip, self.settings.port);
        Ok(Arc::new(DataPlaneClient::new(
            base_url,
            &self.settings,
            self.client.clone(),
        )))
    }

    fn udp(&self, server: &Server) -> Result<Arc<dyn UdpProxy>, ProxyError> {
        let base_url = format!("http://{}:{}", server.ip, self.settings.udp_port);
        Ok(Arc::new(UdpProxyClient::new(
            base_url,
            self.settings.restricted_ports.clone(),
            self.client.clone(),
        )))
    }
}

pub struct DataPlaneClient {
    base_url: String,
    username: String,
    password: String,
    restricted_ports: Vec<u16>,
    client: reqwest::Client,
}

/// Host header match for a listener, with the port unless it is a default one.
fn host_condition(domain: &str, port: u16) -> String {
    let domain = domain.trim();
    match port {
        80 | 443 => format!("{{ hdr(host) -i {domain} }}"),
        port => format!("{{ hdr(host) -i {domain}:{port} }}"),
    }
}

/// Condition of a location redirect. ACME challenges must still reach the
/// challenge backend.
fn redirect_condition(domain: &str) -> String {
    format!("{{ hdr(host) -i {} }} !letsencrypt-acl", domain.trim())
}

fn redirect_frontend(protocol: RedirectProtocol) -> &'static str {
    match protocol {
        RedirectProtocol::Http => "fe_http",
        RedirectProtocol::Https => "fe_https",
    }
}

/// File name the proxy stores a domain's bundle under.
fn certificate_file_name(domain: &str) -> String {
    format!("{}.pem", domain.replace('.', "_"))
}

/// List payloads come wrapped in `data` inside a transaction.
fn data_entries(value: Value) -> Vec<Value> {
    match value {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn entry_str<'a>(entry: &'a Value, key: &str) -> Option<&'a str> {
    entry.get(key).and_then(Value::as_str)
}

fn entry_index(entry: &Value) -> Option<i64> {
    entry.get("index").and_then(Value::as_i64)
}

impl DataPlaneClient {
    pub fn new(base_url: String, settings: &DataPlaneSettings, client: reqwest::Client) -> Self {
        Self {
            base_url,
            username: settings.username.clone(),
            password: settings.password.clone(),
            restricted_ports: settings.restricted_ports.clone(),
            client,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/services/haproxy/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn check(operation: &'static str, response: Response) -> Result<Response, ProxyError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ProxyError::Status {
            operation,
            status,
            body,
        })
    }

    /// GETs a configuration object, `false` on 404.
    async fn exists(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<bool, ProxyError> {
        let response = self.request(Method::GET, path).query(query).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Self::check(operation, response).await.map(|_| true),
        }
    }

    async fn list(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<Value>, ProxyError> {
        let response = self.request(Method::GET, path).query(query).send().await?;
        let response = Self::check(operation, response).await?;
        Ok(data_entries(response.json().await?))
    }

    fn ensure_unrestricted(&self, port: u16) -> Result<(), ProxyError> {
        if self.restricted_ports.contains(&port) {
            return Err(ProxyError::RestrictedPort(port));
        }
        Ok(())
    }

    async fn frontend_exists(
        &self,
        transaction_id: &str,
        mode: ListenerMode,
        port: u16,
    ) -> Result<bool, ProxyError> {
        let path = format!("configuration/frontends/{}", frontend_name(mode, port));
        self.exists("get frontend", &path, &[("transaction_id", transaction_id)])
            .await
    }

    async fn add_frontend(
        &self,
        transaction_id: &str,
        mode: ListenerMode,
        port: u16,
    ) -> Result<(), ProxyError> {
        if port == 80 || port == 443 {
            return match mode {
                ListenerMode::Tcp => Err(ProxyError::ReservedPort(port)),
                ListenerMode::Http => Ok(()),
            };
        }
        self.ensure_unrestricted(port)?;
        if self.frontend_exists(transaction_id, mode, port).await? {
            return Ok(());
        }
        let other = match mode {
            ListenerMode::Http => ListenerMode::Tcp,
            ListenerMode::Tcp => ListenerMode::Http,
        };
        if self.frontend_exists(transaction_id, other, port).await? {
            return Err(ProxyError::ModeConflict {
                port,
                existing: other,
            });
        }

        let name = frontend_name(mode, port);
        let response = self
            .request(Method::POST, "configuration/frontends")
            .query(&[("transaction_id", transaction_id)])
            .json(&json!({
                "name": name,
                "mode": mode,
                "maxconn": FRONTEND_MAXCONN,
                "default_backend": DEFAULT_BACKEND,
            }))
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::check("add frontend", response).await?;

        let response = self
            .request(Method::POST, "configuration/binds")
            .query(&[("transaction_id", transaction_id), ("frontend", &name)])
            .json(&json!({
                "name": format!("{name}_bind"),
                "port": port,
                "ssl": false,
            }))
            .send()
            .await?;
        Self::check("add bind", response).await?;
        log::debug!("Created frontend {name}");
        Ok(())
    }

    async fn delete_frontend(
        &self,
        transaction_id: &str,
        mode: ListenerMode,
        port: u16,
    ) -> Result<(), ProxyError> {
        if port == 80 || port == 443 {
            return Ok(());
        }
        if !self.frontend_exists(transaction_id, mode, port).await? {
            return Ok(());
        }
        let name = frontend_name(mode, port);
        // Other domains may still be routed through this http listener.
        if mode == ListenerMode::Http {
            let remaining = self
                .list(
                    "list backend switching rules",
                    "configuration/backend_switching_rules",
                    &[("transaction_id", transaction_id), ("frontend", &name)],
                )
                .await?;
            if !remaining.is_empty() {
                return Ok(());
            }
        }
        let response = self
            .request(Method::DELETE, &format!("configuration/frontends/{name}"))
            .query(&[("transaction_id", transaction_id)])
            .send()
            .await?;
        Self::check("delete frontend", response).await?;
        Ok(())
    }

    async fn backend_switch_index(
        &self,
        transaction_id: &str,
        mode: ListenerMode,
        port: u16,
        backend: &str,
        domain: &str,
    ) -> Result<Option<i64>, ProxyError> {
        let frontend = frontend_name(mode, port);
        let rules = self
            .list(
                "list backend switching rules",
                "configuration/backend_switching_rules",
                &[("transaction_id", transaction_id), ("frontend", &frontend)],
            )
            .await?;
        let condition = host_condition(domain, port);
        Ok(rules
            .iter()
            .find(|rule| {
                entry_str(rule, "name") == Some(backend)
                    && match mode {
                        ListenerMode::Http => {
                            entry_str(rule, "cond") == Some("if")
                                && entry_str(rule, "cond_test") == Some(condition.as_str())
                        }
                        ListenerMode::Tcp => true,
                    }
            })
            .and_then(entry_index))
    }

    async fn add_backend_switch(
        &self,
        transaction_id: &str,
        mode: ListenerMode,
        port: u16,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        if self
            .backend_switch_index(transaction_id, mode, port, backend, domain)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let body = match mode {
            ListenerMode::Tcp => json!({ "index": 0, "name": backend }),
            ListenerMode::Http => {
                // The default ports keep the challenge rule at index 0.
                let index = if port == 80 || port == 443 { 1 } else { 0 };
                json!({
                    "cond": "if",
                    "cond_test": host_condition(domain, port),
                    "index": index,
                    "name": backend,
                })
            }
        };
        let frontend = frontend_name(mode, port);
        let response = self
            .request(Method::POST, "configuration/backend_switching_rules")
            .query(&[("transaction_id", transaction_id), ("frontend", &frontend)])
            .json(&body)
            .send()
            .await?;
        Self::check("add backend switch", response).await?;
        Ok(())
    }

    async fn delete_backend_switch(
        &self,
        transaction_id: &str,
        mode: ListenerMode,
        port: u16,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        if !self.frontend_exists(transaction_id, mode, port).await? {
            return Ok(());
        }
        let Some(index) = self
            .backend_switch_index(transaction_id, mode, port, backend, domain)
            .await?
        else {
            return Ok(());
        };
        let frontend = frontend_name(mode, port);
        let response = self
            .request(
                Method::DELETE,
                &format!("configuration/backend_switching_rules/{index}"),
            )
            .query(&[("transaction_id", transaction_id), ("frontend", &frontend)])
            .send()
            .await?;
        Self::check("delete backend switch", response).await?;
        Ok(())
    }

    async fn request_rules(
        &self,
        transaction_id: &str,
        frontend: &str,
    ) -> Result<Vec<Value>, ProxyError> {
        self.list(
            "list http request rules",
            "configuration/http_request_rules",
            &[
                ("transaction_id", transaction_id),
                ("parent_type", "frontend"),
                ("parent_name", frontend),
            ],
        )
        .await
    }

    async fn add_request_rule(
        &self,
        transaction_id: &str,
        frontend: &str,
        body: &Value,
    ) -> Result<(), ProxyError> {
        let response = self
            .request(Method::POST, "configuration/http_request_rules")
            .query(&[
                ("transaction_id", transaction_id),
                ("parent_type", "frontend"),
                ("parent_name", frontend),
            ])
            .json(body)
            .send()
            .await?;
        Self::check("add http request rule", response).await?;
        Ok(())
    }

    async fn delete_request_rule(
        &self,
        transaction_id: &str,
        frontend: &str,
        index: i64,
    ) -> Result<(), ProxyError> {
        let response = self
            .request(
                Method::DELETE,
                &format!("configuration/http_request_rules/{index}"),
            )
            .query(&[
                ("transaction_id", transaction_id),
                ("parent_type", "frontend"),
                ("parent_name", frontend),
            ])
            .send()
            .await?;
        Self::check("delete http request rule", response).await?;
        Ok(())
    }

    async fn redirect_index(
        &self,
        transaction_id: &str,
        frontend: &str,
        domain: &str,
    ) -> Result<Option<i64>, ProxyError> {
        let condition = redirect_condition(domain);
        Ok(self
            .request_rules(transaction_id, frontend)
            .await?
            .iter()
            .find(|rule| entry_str(rule, "cond_test") == Some(condition.as_str()))
            .and_then(entry_index))
    }

    async fn https_redirect_index(
        &self,
        transaction_id: &str,
        domain: &str,
    ) -> Result<Option<i64>, ProxyError> {
        let condition = host_condition(domain, 80);
        Ok(self
            .request_rules(transaction_id, "fe_http")
            .await?
            .iter()
            .find(|rule| {
                entry_str(rule, "cond") == Some("if")
                    && entry_str(rule, "cond_test") == Some(condition.as_str())
                    && entry_str(rule, "type") == Some("redirect")
                    && entry_str(rule, "redir_type") == Some("scheme")
                    && entry_str(rule, "redir_value") == Some("https")
            })
            .and_then(entry_index))
    }

    fn server_template(backend: &BackendKey, replicas: u32) -> Value {
        json!({
            "prefix": backend.server_prefix(),
            "fqdn": backend.service,
            "port": backend.port,
            "check": "disabled",
            "resolvers": "docker",
            "init-addr": "libc,none",
            "num_or_range": replicas.max(1).to_string(),
        })
    }
}

#[async_trait]
impl ProxyControl for DataPlaneClient {
    async fn fetch_new_transaction(&self) -> Result<String, ProxyError> {
        let response = self
            .request(Method::GET, "configuration/version")
            .send()
            .await?;
        let version = Self::check("fetch configuration version", response)
            .await?
            .text()
            .await?;
        let version = version.trim().trim_matches('"').to_string();

        let response = self
            .request(Method::POST, "transactions")
            .query(&[("version", version.as_str())])
            .send()
            .await?;
        let body: Value = Self::check("open transaction", response).await?.json().await?;
        entry_str(&body, "id")
            .map(str::to_string)
            .ok_or_else(|| ProxyError::InvalidResponse("transaction without id".to_string()))
    }

    async fn commit_transaction(&self, transaction_id: &str) -> Result<(), ProxyError> {
        let response = self
            .request(Method::PUT, &format!("transactions/{transaction_id}"))
            .query(&[("force_reload", "true")])
            .send()
            .await?;
        Self::check("commit transaction", response).await?;
        Ok(())
    }

    async fn delete_transaction(&self, transaction_id: &str) -> Result<(), ProxyError> {
        let response = self
            .request(Method::DELETE, &format!("transactions/{transaction_id}"))
            .send()
            .await?;
        Self::check("delete transaction", response).await?;
        Ok(())
    }

    async fn is_backend_exist(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<bool, ProxyError> {
        self.exists(
            "get backend",
            &format!("configuration/backends/{}", backend.name()),
            &[("transaction_id", transaction_id)],
        )
        .await
    }

    async fn add_backend(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
        replicas: u32,
    ) -> Result<(), ProxyError> {
        let name = backend.name();
        let response = self
            .request(Method::POST, "configuration/backends")
            .query(&[("transaction_id", transaction_id)])
            .json(&json!({
                "name": name,
                "mode": backend.mode,
                "balance": { "algorithm": "roundrobin" },
            }))
            .send()
            .await?;
        Self::check("add backend", response).await?;

        let response = self
            .request(Method::POST, "configuration/server_templates")
            .query(&[("transaction_id", transaction_id), ("backend", &name)])
            .json(&Self::server_template(backend, replicas))
            .send()
            .await?;
        Self::check("add server template", response).await?;
        log::debug!("Added backend {name} with {replicas} replicas");
        Ok(())
    }

    async fn remove_backend(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<(), ProxyError> {
        let response = self
            .request(
                Method::DELETE,
                &format!("configuration/backends/{}", backend.name()),
            )
            .query(&[("transaction_id", transaction_id)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check("remove backend", response).await?;
        Ok(())
    }

    async fn get_replica_count(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
    ) -> Result<u32, ProxyError> {
        let name = backend.name();
        let response = self
            .request(
                Method::GET,
                &format!("configuration/server_templates/{}", backend.server_prefix()),
            )
            .query(&[("transaction_id", transaction_id), ("backend", &name)])
            .send()
            .await?;
        let mut body: Value = Self::check("get server template", response)
            .await?
            .json()
            .await?;
        let template = match body.get_mut("data") {
            Some(data) => data.take(),
            None => body,
        };
        match template.get("num_or_range") {
            Some(Value::String(count)) => count.parse().map_err(|_| {
                ProxyError::InvalidResponse(format!("replica count {count} for {name}"))
            }),
            Some(Value::Number(count)) => count
                .as_u64()
                .and_then(|count| u32::try_from(count).ok())
                .ok_or_else(|| ProxyError::InvalidResponse(format!("replica count for {name}"))),
            _ => Err(ProxyError::InvalidResponse(format!(
                "server template of {name} has no replica count"
            ))),
        }
    }

    async fn update_backend_replicas(
        &self,
        transaction_id: &str,
        backend: &BackendKey,
        replicas: u32,
    ) -> Result<(), ProxyError> {
        let name = backend.name();
        let response = self
            .request(
                Method::PUT,
                &format!("configuration/server_templates/{}", backend.server_prefix()),
            )
            .query(&[("transaction_id", transaction_id), ("backend", &name)])
            .json(&Self::server_template(backend, replicas))
            .send()
            .await?;
        Self::check("update server template", response).await?;
        Ok(())
    }

    async fn add_http_link(
        &self,
        transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.add_backend_switch(transaction_id, ListenerMode::Http, 80, backend, domain)
            .await
    }

    async fn delete_http_link(
        &self,
        transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.delete_backend_switch(transaction_id, ListenerMode::Http, 80, backend, domain)
            .await
    }

    async fn add_https_link(
        &self,
        transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.add_backend_switch(transaction_id, ListenerMode::Http, 443, backend, domain)
            .await
    }

    async fn delete_https_link(
        &self,
        transaction_id: &str,
        backend: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        self.delete_backend_switch(transaction_id, ListenerMode::Http, 443, backend, domain)
            .await
    }

    async fn add_tcp_link(
        &self,
        transaction_id: &str,
        backend: &str,
        port: u16,
        domain: Option<&str>,
        mode: ListenerMode,
    ) -> Result<(), ProxyError> {
        if mode == ListenerMode::Http && domain.is_none() {
            return Err(ProxyError::MissingDomain(port));
        }
        self.add_frontend(transaction_id, mode, port).await?;
        self.add_backend_switch(transaction_id, mode, port, backend, domain.unwrap_or_default())
            .await
    }

    async fn delete_tcp_link(
        &self,
        transaction_id: &str,
        backend: &str,
        port: u16,
        domain: Option<&str>,
        mode: ListenerMode,
    ) -> Result<(), ProxyError> {
        self.delete_backend_switch(transaction_id, mode, port, backend, domain.unwrap_or_default())
            .await?;
        self.delete_frontend(transaction_id, mode, port).await
    }

    async fn add_redirect(
        &self,
        transaction_id: &str,
        protocol: RedirectProtocol,
        domain: &str,
        redirect_url: &str,
    ) -> Result<(), ProxyError> {
        let frontend = redirect_frontend(protocol);
        if self
            .redirect_index(transaction_id, frontend, domain)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let body = json!({
            "type": "redirect",
            "redir_code": 302,
            "redir_type": "location",
            "redir_value": redirect_url,
            "index": 0,
            "cond": "if",
            "cond_test": redirect_condition(domain),
        });
        self.add_request_rule(transaction_id, frontend, &body).await
    }

    async fn delete_redirect(
        &self,
        transaction_id: &str,
        protocol: RedirectProtocol,
        domain: &str,
    ) -> Result<(), ProxyError> {
        let frontend = redirect_frontend(protocol);
        match self.redirect_index(transaction_id, frontend, domain).await? {
            Some(index) => {
                self.delete_request_rule(transaction_id, frontend, index)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn enable_https_redirect(
        &self,
        transaction_id: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        if self
            .https_redirect_index(transaction_id, domain)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let body = json!({
            "type": "redirect",
            "redir_code": 301,
            "redir_type": "scheme",
            "redir_value": "https",
            "index": 0,
            "cond": "if",
            "cond_test": host_condition(domain, 80),
        });
        self.add_request_rule(transaction_id, "fe_http", &body).await
    }

    async fn disable_https_redirect(
        &self,
        transaction_id: &str,
        domain: &str,
    ) -> Result<(), ProxyError> {
        match self.https_redirect_index(transaction_id, domain).await? {
            Some(index) => {
                self.delete_request_rule(transaction_id, "fe_http", index)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn update_tls(
        &self,
        _transaction_id: &str,
        domain: &str,
        private_key: &str,
        full_chain: &str,
    ) -> Result<(), ProxyError> {
        // Certificate storage is not transactional on the Data Plane API.
        let file_name = certificate_file_name(domain);
        let bundle = format!("{full_chain}\n{private_key}");
        let part = reqwest::multipart::Part::text(bundle.clone()).file_name(file_name.clone());
        let form = reqwest::multipart::Form::new().part("file_upload", part);
        let response = self
            .request(Method::POST, "storage/ssl_certificates")
            .multipart(form)
            .send()
            .await?;
        if response.status() != StatusCode::CONFLICT {
            Self::check("upload certificate", response).await?;
            return Ok(());
        }

        let response = self
            .request(
                Method::PUT,
                &format!("storage/ssl_certificates/{file_name}"),
            )
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(bundle)
            .send()
            .await?;
        Self::check("replace certificate", response).await?;
        Ok(())
    }
}
