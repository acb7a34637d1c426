use async_trait::async_trait;
use chrono::Utc;

use super::{WorkerContext, WorkerError, round_keys};
use crate::model::{Domain, TlsStatus};
use crate::proxy::{ProxyControl, ProxyError, ProxyMutation, ProxyTransactionSet};
use crate::queue::SslGenerateRequest;
use crate::tls::generate_private_key;

struct PublishCertificate {
    domain: String,
    private_key: String,
    full_chain: String,
}

#[async_trait]
impl ProxyMutation for PublishCertificate {
    async fn apply(
        &self,
        proxy: &dyn ProxyControl,
        transaction_id: &str,
    ) -> Result<(), ProxyError> {
        proxy
            .update_tls(
                transaction_id,
                &self.domain,
                &self.private_key,
                &self.full_chain,
            )
            .await
    }
}

pub(super) async fn generate(
    ctx: &WorkerContext,
    request: SslGenerateRequest,
) -> Result<(), WorkerError> {
    let Some(mut domain) = ctx.store.get_domain(&request.domain_id).await? else {
        log::warn!("Domain {} no longer exists", request.domain_id);
        return Ok(());
    };
    if domain.is_ip_address() {
        log::info!("Skipping certificate for IP address {}", domain.name);
        return Ok(());
    }

    let verified = match ctx.verifier.verify(&domain.name).await {
        Ok(verified) => verified,
        Err(e) => {
            log::warn!("Verifying {} failed: {e}", domain.name);
            false
        }
    };
    if !verified {
        if domain.tls_status == TlsStatus::None {
            log::debug!("{} does not point at this controller yet", domain.name);
        } else {
            log::warn!("{} no longer points at this controller", domain.name);
            ctx.store
                .update_tls_status(&domain.id, TlsStatus::Failed)
                .await?;
        }
        return Ok(());
    }

    if domain.private_key.is_empty() {
        domain.private_key = generate_private_key()?;
    }

    let still_valid = domain.tls_status == TlsStatus::Issued
        && !domain.full_chain.is_empty()
        && !domain.expires_within(ctx.settings.renew_before_days, Utc::now());
    if still_valid {
        log::info!(
            "Certificate of {} is valid until {}, republishing",
            domain.name,
            domain
                .expires_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default()
        );
    } else if !issue(ctx, &mut domain).await? {
        return Ok(());
    }

    publish(ctx, &domain).await
}

/// Obtains a certificate and stores it on `domain`. Returns false when
/// issuance failed and the domain was marked Failed.
async fn issue(ctx: &WorkerContext, domain: &mut Domain) -> Result<bool, WorkerError> {
    // The key is stored before ordering so a retry signs with the same key.
    domain.tls_status = TlsStatus::Pending;
    ctx.store.update_domain(domain.clone()).await?;

    match ctx.issuer.obtain(&domain.name, &domain.private_key).await {
        Ok(certificate) => {
            domain.full_chain = certificate.full_chain;
            domain.expires_at = Some(certificate.expires_at);
            domain.issuer = certificate.issuer;
            domain.issued_at = Some(Utc::now());
            domain.tls_status = TlsStatus::Issued;
            ctx.store.update_domain(domain.clone()).await?;
            log::info!("Certificate issued for {}", domain.name);
            Ok(true)
        }
        Err(e) => {
            log::error!("Certificate issuance for {} failed: {e}", domain.name);
            ctx.store
                .update_tls_status(&domain.id, TlsStatus::Failed)
                .await?;
            Ok(false)
        }
    }
}

pub(super) async fn publish(ctx: &WorkerContext, domain: &Domain) -> Result<(), WorkerError> {
    let mutation = PublishCertificate {
        domain: domain.name.clone(),
        private_key: domain.private_key.clone(),
        full_chain: domain.full_chain.clone(),
    };
    let _guard = ctx
        .round_locks
        .acquire(round_keys(None, Some(&domain.name)))
        .await;
    let nodes = ctx.proxy_nodes().await?;
    let committed = ProxyTransactionSet::run(nodes, &[&mutation]).await?;
    log::info!(
        "Published certificate of {} to {committed} proxy node(s)",
        domain.name
    );
    Ok(())
}
