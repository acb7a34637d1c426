//! Ingress rules: expose an application port through every active proxy.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{WorkerContext, WorkerError, backend_for, round_keys};
use crate::model::{Application, IngressRule, Protocol, RuleStatus};
use crate::proxy::{
    BackendKey, ListenerMode, ProxyControl, ProxyError, ProxyMutation, ProxyTransactionSet,
};
use crate::queue::{HttpsRedirectRequest, RuleRequest};

/// Frontend binding of a rule, chosen by protocol and port.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Http { domain: String },
    Https { domain: String },
    Tcp {
        port: u16,
        domain: Option<String>,
        mode: ListenerMode,
    },
}

impl Link {
    fn for_rule(rule: &IngressRule, domain: Option<&str>) -> Option<Link> {
        let domain = domain.map(str::to_string);
        match (rule.protocol, domain) {
            (Protocol::Https, Some(domain)) => Some(Link::Https { domain }),
            (Protocol::Http, Some(domain)) if rule.port == 80 => Some(Link::Http { domain }),
            (Protocol::Http, Some(domain)) => Some(Link::Tcp {
                port: rule.port,
                domain: Some(domain),
                mode: ListenerMode::Http,
            }),
            (Protocol::Tcp, _) => Some(Link::Tcp {
                port: rule.port,
                domain: None,
                mode: ListenerMode::Tcp,
            }),
            (Protocol::Http | Protocol::Https, None) | (Protocol::Udp, _) => None,
        }
    }

    async fn add(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
        backend: &str,
    ) -> Result<(), ProxyError> {
        match self {
            Link::Http { domain } => proxy.add_http_link(transaction_id, backend, domain).await,
            Link::Https { domain } => proxy.add_https_link(transaction_id, backend, domain).await,
            Link::Tcp { port, domain, mode } => {
                proxy
                    .add_tcp_link(transaction_id, backend, *port, domain.as_deref(), *mode)
                    .await
            }
        }
    }

    async fn delete(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
        backend: &str,
    ) -> Result<(), ProxyError> {
        match self {
            Link::Http { domain } => {
                proxy
                    .delete_http_link(transaction_id, backend, domain)
                    .await
            }
            Link::Https { domain } => {
                proxy
                    .delete_https_link(transaction_id, backend, domain)
                    .await
            }
            Link::Tcp { port, domain, mode } => {
                proxy
                    .delete_tcp_link(transaction_id, backend, *port, domain.as_deref(), *mode)
                    .await
            }
        }
    }

    fn https_domain(&self) -> Option<&str> {
        match self {
            Link::Https { domain } => Some(domain),
            _ => None,
        }
    }
}

struct ApplyIngress {
    backend: BackendKey,
    replicas: u32,
    link: Link,
    https_redirect: bool,
}

#[async_trait]
impl ProxyMutation for ApplyIngress {
    async fn apply(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
    ) -> Result<(), ProxyError> {
        if !proxy.is_backend_exist(transaction_id, &self.backend).await? {
            proxy
                .add_backend(transaction_id, &self.backend, self.replicas)
                .await?;
        } else if proxy.get_replica_count(transaction_id, &self.backend).await? != self.replicas {
            proxy
                .update_backend_replicas(transaction_id, &self.backend, self.replicas)
                .await?;
        }
        self.link
            .add(proxy, transaction_id, &self.backend.name())
            .await?;
        if self.https_redirect
            && let Some(domain) = self.link.https_domain()
        {
            proxy.enable_https_redirect(transaction_id, domain).await?;
        }
        Ok(())
    }
}

struct DeleteIngress {
    backend: BackendKey,
    link: Link,
    remove_backend: bool,
    https_redirect: bool,
}

#[async_trait]
impl ProxyMutation for DeleteIngress {
    async fn apply(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
    ) -> Result<(), ProxyError> {
        self.link
            .delete(proxy, transaction_id, &self.backend.name())
            .await?;
        if self.https_redirect
            && let Some(domain) = self.link.https_domain()
        {
            proxy.disable_https_redirect(transaction_id, domain).await?;
        }
        if self.remove_backend {
            proxy.remove_backend(transaction_id, &self.backend).await?;
        }
        Ok(())
    }
}

/// Drops backends whose links are already gone or are removed earlier in
/// the same round.
struct RemoveBackends {
    backends: Vec<BackendKey>,
}

#[async_trait]
impl ProxyMutation for RemoveBackends {
    async fn apply(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
    ) -> Result<(), ProxyError> {
        for backend in &self.backends {
            if proxy.is_backend_exist(transaction_id, backend).await? {
                proxy.remove_backend(transaction_id, backend).await?;
            }
        }
        Ok(())
    }
}

struct ToggleHttpsRedirect {
    domain: String,
    enabled: bool,
}

#[async_trait]
impl ProxyMutation for ToggleHttpsRedirect {
    async fn apply(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
    ) -> Result<(), ProxyError> {
        if self.enabled {
            proxy.enable_https_redirect(transaction_id, &self.domain).await
        } else {
            proxy
                .disable_https_redirect(transaction_id, &self.domain)
                .await
        }
    }
}

/// Domain name of a rule, `None` when it has none or the domain row is gone.
async fn domain_name(
    ctx: &WorkerContext,
    rule: &IngressRule,
) -> Result<Option<String>, WorkerError> {
    let Some(domain_id) = &rule.domain_id else {
        return Ok(None);
    };
    Ok(ctx
        .store
        .get_domain(domain_id)
        .await?
        .map(|domain| domain.name))
}

async fn mark(ctx: &WorkerContext, rule: &IngressRule, status: RuleStatus) -> Result<(), WorkerError> {
    ctx.store.update_ingress_rule_status(&rule.id, status).await?;
    Ok(())
}

pub(super) async fn apply(ctx: &WorkerContext, request: RuleRequest) -> Result<(), WorkerError> {
    let Some(rule) = ctx.store.get_ingress_rule(&request.id).await? else {
        log::warn!("Ingress rule {} no longer exists", request.id);
        return Ok(());
    };
    if rule.status != RuleStatus::Pending {
        log::debug!("Ingress rule {} is {}, skipping apply", rule.id, rule.status.as_ref());
        return Ok(());
    }
    let Some(app) = ctx.store.get_application(&rule.application_id).await? else {
        log::error!("Ingress rule {} points at a missing application", rule.id);
        return mark(ctx, &rule, RuleStatus::Failed).await;
    };

    if rule.protocol == Protocol::Udp {
        let status = apply_udp(ctx, &rule, &app).await?;
        return mark(ctx, &rule, status).await;
    }

    let domain = domain_name(ctx, &rule).await?;
    let (Some(backend), Some(link)) = (
        backend_for(&rule, &app.name),
        Link::for_rule(&rule, domain.as_deref()),
    ) else {
        log::error!(
            "Ingress rule {} needs a domain for {}",
            rule.id,
            rule.protocol.as_ref()
        );
        return mark(ctx, &rule, RuleStatus::Failed).await;
    };
    let mutation = ApplyIngress {
        backend,
        replicas: ctx.backend_replicas(&app).await?,
        link,
        https_redirect: rule.https_redirect,
    };

    let _guard = ctx
        .round_locks
        .acquire(round_keys(Some(&app.id), domain.as_deref()))
        .await;
    let nodes = ctx.proxy_nodes().await?;
    match ProxyTransactionSet::run(nodes, &[&mutation]).await {
        Ok(committed) => {
            log::info!(
                "Applied ingress rule {} ({} {} -> {}) on {committed} proxy node(s)",
                rule.id,
                rule.protocol.as_ref(),
                rule.port,
                mutation.backend.name()
            );
            mark(ctx, &rule, RuleStatus::Applied).await
        }
        Err(e) => {
            log::error!("Applying ingress rule {} failed: {e}", rule.id);
            mark(ctx, &rule, RuleStatus::Failed).await
        }
    }
}

async fn apply_udp(
    ctx: &WorkerContext,
    rule: &IngressRule,
    app: &Application,
) -> Result<RuleStatus, WorkerError> {
    let mut status = RuleStatus::Applied;
    for (hostname, udp) in ctx.udp_proxies().await? {
        if let Err(e) = udp.add(rule.port, rule.target_port, &app.name).await {
            log::error!("UDP forward {} on {hostname} failed: {e}", rule.port);
            status = RuleStatus::Failed;
        }
    }
    Ok(status)
}

pub(super) async fn delete(ctx: &WorkerContext, request: RuleRequest) -> Result<(), WorkerError> {
    let Some(rule) = ctx.store.get_ingress_rule(&request.id).await? else {
        log::debug!("Ingress rule {} already deleted", request.id);
        return Ok(());
    };
    if rule.status != RuleStatus::Deleting {
        log::warn!(
            "Ingress rule {} is {}, refusing to delete",
            rule.id,
            rule.status.as_ref()
        );
        return Ok(());
    }
    // Application deletion detaches every rule before the row goes, so
    // there is nothing left on the proxies to remove here.
    let Some(app) = ctx.store.get_application(&rule.application_id).await? else {
        log::warn!(
            "Application of ingress rule {} is gone, dropping the rule",
            rule.id
        );
        ctx.store.delete_ingress_rule(&rule.id).await?;
        return Ok(());
    };

    if rule.protocol == Protocol::Udp {
        for (hostname, udp) in ctx.udp_proxies().await? {
            if let Err(e) = udp.remove(rule.port, rule.target_port, &app.name).await {
                log::warn!("Removing UDP forward {} on {hostname} failed: {e}", rule.port);
            }
        }
        ctx.store.delete_ingress_rule(&rule.id).await?;
        return Ok(());
    }

    let domain = domain_name(ctx, &rule).await?;
    let Some(backend) = backend_for(&rule, &app.name) else {
        ctx.store.delete_ingress_rule(&rule.id).await?;
        return Ok(());
    };
    let link = Link::for_rule(&rule, domain.as_deref());

    let _guard = ctx
        .round_locks
        .acquire(round_keys(Some(&app.id), domain.as_deref()))
        .await;
    // Read under the lock so a concurrent apply for a sibling rule is seen.
    let shared = ctx
        .store
        .ingress_rules_for_application(&app.id)
        .await?
        .iter()
        .any(|other| {
            other.id != rule.id
                && other.status != RuleStatus::Deleting
                && other.protocol != Protocol::Udp
                && other.shares_backend(&rule)
        });

    let Some(link) = link else {
        // The host link went with the domain. The backend may still be there.
        log::warn!("Ingress rule {} has no domain left, removing its backend only", rule.id);
        if !shared {
            let mutation = RemoveBackends {
                backends: vec![backend],
            };
            let nodes = ctx.proxy_nodes().await?;
            ProxyTransactionSet::run(nodes, &[&mutation]).await?;
        }
        ctx.store.delete_ingress_rule(&rule.id).await?;
        return Ok(());
    };
    let mutation = DeleteIngress {
        backend,
        link,
        remove_backend: !shared,
        https_redirect: rule.https_redirect,
    };
    let nodes = ctx.proxy_nodes().await?;
    let committed = ProxyTransactionSet::run(nodes, &[&mutation]).await?;
    log::info!(
        "Deleted ingress rule {} on {committed} proxy node(s){}",
        rule.id,
        if shared { ", backend kept" } else { "" }
    );
    ctx.store.delete_ingress_rule(&rule.id).await?;
    Ok(())
}

/// Pushes an Applied rule to the proxies again without touching its status.
/// Returns false when the rule cannot be expressed anymore.
pub(super) async fn reapply(ctx: &WorkerContext, rule: &IngressRule) -> Result<bool, WorkerError> {
    let Some(app) = ctx.store.get_application(&rule.application_id).await? else {
        return Ok(false);
    };
    if rule.protocol == Protocol::Udp {
        return Ok(apply_udp(ctx, rule, &app).await? == RuleStatus::Applied);
    }
    let domain = domain_name(ctx, rule).await?;
    let (Some(backend), Some(link)) = (
        backend_for(rule, &app.name),
        Link::for_rule(rule, domain.as_deref()),
    ) else {
        return Ok(false);
    };
    let mutation = ApplyIngress {
        backend,
        replicas: ctx.backend_replicas(&app).await?,
        link,
        https_redirect: rule.https_redirect,
    };
    let _guard = ctx
        .round_locks
        .acquire(round_keys(Some(&app.id), domain.as_deref()))
        .await;
    // The status may have moved while waiting for the lock.
    match ctx.store.get_ingress_rule(&rule.id).await? {
        Some(current) if current.status == RuleStatus::Applied => {}
        _ => return Ok(false),
    }
    let nodes = ctx.proxy_nodes().await?;
    ProxyTransactionSet::run(nodes, &[&mutation]).await?;
    Ok(true)
}

/// Removes every rule of `app` from the proxies in one round. Rows are left
/// to the caller.
pub(super) async fn detach_application(
    ctx: &WorkerContext,
    app: &Application,
    rules: &[IngressRule],
) -> Result<(), WorkerError> {
    let mut keys = round_keys(Some(&app.id), None);
    let mut links = Vec::new();
    let mut backends = BTreeSet::new();
    for rule in rules {
        if rule.protocol == Protocol::Udp {
            for (hostname, udp) in ctx.udp_proxies().await? {
                if let Err(e) = udp.remove(rule.port, rule.target_port, &app.name).await {
                    log::warn!("Removing UDP forward {} on {hostname} failed: {e}", rule.port);
                }
            }
            continue;
        }
        let Some(backend) = backend_for(rule, &app.name) else {
            continue;
        };
        let domain = domain_name(ctx, rule).await?;
        keys.extend(round_keys(None, domain.as_deref()));
        if let Some(link) = Link::for_rule(rule, domain.as_deref()) {
            links.push(DeleteIngress {
                backend: backend.clone(),
                link,
                remove_backend: false,
                https_redirect: rule.https_redirect,
            });
        }
        backends.insert(backend);
    }
    if backends.is_empty() {
        return Ok(());
    }

    let remove = RemoveBackends {
        backends: backends.into_iter().collect(),
    };
    let mut mutations: Vec<&dyn ProxyMutation> =
        links.iter().map(|m| m as &dyn ProxyMutation).collect();
    mutations.push(&remove);

    let _guard = ctx.round_locks.acquire(keys).await;
    let nodes = ctx.proxy_nodes().await?;
    let committed = ProxyTransactionSet::run(nodes, &mutations).await?;
    log::info!(
        "Removed {} link(s) and {} backend(s) of {} on {committed} proxy node(s)",
        links.len(),
        remove.backends.len(),
        app.name
    );
    Ok(())
}

pub(super) async fn toggle_https_redirect(
    ctx: &WorkerContext,
    request: HttpsRedirectRequest,
) -> Result<(), WorkerError> {
    let Some(rule) = ctx.store.get_ingress_rule(&request.id).await? else {
        log::warn!("Ingress rule {} no longer exists", request.id);
        return Ok(());
    };
    if rule.status == RuleStatus::Deleting || rule.protocol != Protocol::Https {
        log::warn!(
            "Ingress rule {} ({} {}) cannot carry an HTTPS redirect",
            rule.id,
            rule.protocol.as_ref(),
            rule.status.as_ref()
        );
        return Ok(());
    }
    let Some(domain) = domain_name(ctx, &rule).await? else {
        log::error!("Ingress rule {} has no domain", rule.id);
        return Ok(());
    };

    let mutation = ToggleHttpsRedirect {
        domain,
        enabled: request.enabled,
    };
    let _guard = ctx
        .round_locks
        .acquire(round_keys(Some(&rule.application_id), Some(&mutation.domain)))
        .await;
    let nodes = ctx.proxy_nodes().await?;
    ProxyTransactionSet::run(nodes, &[&mutation]).await?;
    ctx.store
        .set_https_redirect(&rule.id, request.enabled)
        .await?;
    log::info!(
        "HTTPS redirect for {} {}",
        mutation.domain,
        if request.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
