//! Redirect rules: host-matched 302 redirects on the shared frontends.

use async_trait::async_trait;

use super::{WorkerContext, WorkerError, round_keys};
use crate::model::{RedirectProtocol, RedirectRule, RuleStatus};
use crate::proxy::{ProxyControl, ProxyError, ProxyMutation, ProxyTransactionSet};
use crate::queue::RuleRequest;

struct AddRedirect {
    protocol: RedirectProtocol,
    domain: String,
    url: String,
}

#[async_trait]
impl ProxyMutation for AddRedirect {
    async fn apply(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
    ) -> Result<(), ProxyError> {
        proxy
            .add_redirect(transaction_id, self.protocol, &self.domain, &self.url)
            .await
    }
}

struct DeleteRedirect {
    protocol: RedirectProtocol,
    domain: String,
}

#[async_trait]
impl ProxyMutation for DeleteRedirect {
    async fn apply(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
    ) -> Result<(), ProxyError> {
        proxy
            .delete_redirect(transaction_id, self.protocol, &self.domain)
            .await
    }
}

async fn domain_name(ctx: &WorkerContext, rule: &RedirectRule) -> Result<Option<String>, WorkerError> {
    Ok(ctx
        .store
        .get_domain(&rule.domain_id)
        .await?
        .map(|domain| domain.name))
}

pub(super) async fn apply(ctx: &WorkerContext, request: RuleRequest) -> Result<(), WorkerError> {
    let Some(rule) = ctx.store.get_redirect_rule(&request.id).await? else {
        log::warn!("Redirect rule {} no longer exists", request.id);
        return Ok(());
    };
    if rule.status != RuleStatus::Pending {
        log::debug!("Redirect rule {} is {}, skipping apply", rule.id, rule.status.as_ref());
        return Ok(());
    }
    let Some(domain) = domain_name(ctx, &rule).await? else {
        log::error!("Redirect rule {} points at a missing domain", rule.id);
        ctx.store
            .update_redirect_rule_status(&rule.id, RuleStatus::Failed)
            .await?;
        return Ok(());
    };

    let mutation = AddRedirect {
        protocol: rule.protocol,
        domain,
        url: rule.redirect_url.clone(),
    };
    let _guard = ctx
        .round_locks
        .acquire(round_keys(None, Some(&mutation.domain)))
        .await;
    let nodes = ctx.proxy_nodes().await?;
    let status = match ProxyTransactionSet::run(nodes, &[&mutation]).await {
        Ok(committed) => {
            log::info!(
                "Redirect {} -> {} applied on {committed} proxy node(s)",
                mutation.domain,
                mutation.url
            );
            RuleStatus::Applied
        }
        Err(e) => {
            log::error!("Applying redirect rule {} failed: {e}", rule.id);
            RuleStatus::Failed
        }
    };
    ctx.store
        .update_redirect_rule_status(&rule.id, status)
        .await?;
    Ok(())
}

/// Pushes an Applied redirect to the proxies again. Returns false when its
/// domain is gone or the rule changed status meanwhile.
pub(super) async fn reapply(ctx: &WorkerContext, rule: &RedirectRule) -> Result<bool, WorkerError> {
    let Some(domain) = domain_name(ctx, rule).await? else {
        return Ok(false);
    };
    let mutation = AddRedirect {
        protocol: rule.protocol,
        domain,
        url: rule.redirect_url.clone(),
    };
    let _guard = ctx
        .round_locks
        .acquire(round_keys(None, Some(&mutation.domain)))
        .await;
    match ctx.store.get_redirect_rule(&rule.id).await? {
        Some(current) if current.status == RuleStatus::Applied => {}
        _ => return Ok(false),
    }
    let nodes = ctx.proxy_nodes().await?;
    ProxyTransactionSet::run(nodes, &[&mutation]).await?;
    Ok(true)
}

pub(super) async fn delete(ctx: &WorkerContext, request: RuleRequest) -> Result<(), WorkerError> {
    let Some(rule) = ctx.store.get_redirect_rule(&request.id).await? else {
        log::debug!("Redirect rule {} already deleted", request.id);
        return Ok(());
    };
    if rule.status != RuleStatus::Deleting {
        log::warn!(
            "Redirect rule {} is {}, refusing to delete",
            rule.id,
            rule.status.as_ref()
        );
        return Ok(());
    }
    let Some(domain) = domain_name(ctx, &rule).await? else {
        log::warn!("Domain of redirect rule {} is gone, dropping the rule", rule.id);
        ctx.store.delete_redirect_rule(&rule.id).await?;
        return Ok(());
    };

    let mutation = DeleteRedirect {
        protocol: rule.protocol,
        domain,
    };
    let _guard = ctx
        .round_locks
        .acquire(round_keys(None, Some(&mutation.domain)))
        .await;
    let nodes = ctx.proxy_nodes().await?;
    ProxyTransactionSet::run(nodes, &[&mutation]).await?;
    ctx.store.delete_redirect_rule(&rule.id).await?;
    log::info!("Redirect rule {} deleted", rule.id);
    Ok(())
}
