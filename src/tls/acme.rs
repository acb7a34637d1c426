use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use instant_acme::{
    Account, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder, OrderStatus,
    RetryPolicy,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::{CertificateIssuer, ChallengeStore, IssuedCertificate, TlsError, inspect_chain};

const SELF_SIGNED_VALIDITY_DAYS: i64 = 90;

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeSettings {
    pub email: String,
    /// Directory URL, Let's Encrypt production when unset.
    #[serde(default)]
    pub directory_url: Option<String>,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_poll_timeout() -> u64 {
    90
}

/// Issues certificates over ACME HTTP-01. Challenge responses are handed to
/// the challenge server through the shared store.
pub struct AcmeIssuer {
    settings: AcmeSettings,
    challenges: Arc<ChallengeStore>,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(settings: AcmeSettings, challenges: Arc<ChallengeStore>) -> Self {
        Self {
            settings,
            challenges,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account, TlsError> {
        self.account
            .get_or_try_init(|| async {
                let contact = format!("mailto:{}", self.settings.email);
                let directory = self
                    .settings
                    .directory_url
                    .clone()
                    .unwrap_or_else(|| LetsEncrypt::Production.url().to_string());
                log::info!("Registering ACME account {contact} at {directory}");
                let (account, _) = Account::builder()?
                    .create(
                        &NewAccount {
                            contact: &[&contact],
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        directory,
                        None,
                    )
                    .await?;
                Ok::<_, TlsError>(account)
            })
            .await
    }

    async fn run_order(
        &self,
        domain: &str,
        private_key_pem: &str,
        tokens: &mut Vec<String>,
    ) -> Result<String, TlsError> {
        let account = self.account().await?;
        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut authorizations = order.authorizations();
        while let Some(authorization) = authorizations.next().await {
            let mut authorization = authorization?;
            let mut challenge = authorization
                .challenge(ChallengeType::Http01)
                .ok_or_else(|| TlsError::NoChallenge(domain.to_string()))?;
            let key_authorization = challenge.key_authorization();
            let token = challenge.token.clone();
            self.challenges
                .insert(token.clone(), key_authorization.as_str().to_string());
            tokens.push(token);
            challenge.set_ready().await?;
        }

        let retry_policy = RetryPolicy::new()
            .timeout(Duration::from_secs(self.settings.poll_timeout_secs))
            .initial_delay(Duration::from_secs(2));
        let status = order.poll_ready(&retry_policy).await?;
        if status != OrderStatus::Ready {
            return Err(TlsError::Order {
                domain: domain.to_string(),
                status: format!("{status:?}"),
            });
        }

        let key = KeyPair::from_pem(private_key_pem)?;
        let csr = CertificateParams::new(vec![domain.to_string()])?.serialize_request(&key)?;
        order.finalize_csr(csr.der()).await?;
        Ok(order.poll_certificate(&retry_policy).await?)
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn obtain(
        &self,
        domain: &str,
        private_key_pem: &str,
    ) -> Result<IssuedCertificate, TlsError> {
        log::info!("Starting ACME order for {domain}");
        let mut tokens = Vec::new();
        let result = self.run_order(domain, private_key_pem, &mut tokens).await;
        for token in &tokens {
            self.challenges.remove(token);
        }
        let full_chain = result?;
        let (expires_at, issuer) = inspect_chain(&full_chain)?;
        log::info!("Certificate for {domain} issued by {issuer}, expires {expires_at}");
        Ok(IssuedCertificate {
            full_chain,
            expires_at,
            issuer,
        })
    }
}

/// Signs certificates locally, for running without a reachable CA.
#[derive(Debug, Default)]
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn obtain(
        &self,
        domain: &str,
        private_key_pem: &str,
    ) -> Result<IssuedCertificate, TlsError> {
        log::info!("Generating self-signed certificate for {domain}");
        let key = KeyPair::from_pem(private_key_pem)?;
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        dn.push(DnType::OrganizationName, "wharf self-signed");
        params.distinguished_name = dn;

        let now = Utc::now();
        let expiry = now + chrono::Duration::days(SELF_SIGNED_VALIDITY_DAYS);
        params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

        let full_chain = params.self_signed(&key)?.pem();
        let (expires_at, issuer) = inspect_chain(&full_chain)?;
        Ok(IssuedCertificate {
            full_chain,
            expires_at,
            issuer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::generate_private_key;

    #[tokio::test]
    async fn test_self_signed_issuer() {
        let key = generate_private_key().unwrap();
        let issued = SelfSignedIssuer
            .obtain("app.example.com", &key)
            .await
            .unwrap();
        assert!(issued.full_chain.contains("BEGIN CERTIFICATE"));
        assert_eq!(issued.issuer, "wharf self-signed");
        let days = (issued.expires_at - Utc::now()).num_days();
        assert!((88..=90).contains(&days), "unexpected validity {days}");
    }

    #[tokio::test]
    async fn test_self_signed_rejects_bad_key() {
        assert!(matches!(
            SelfSignedIssuer.obtain("app.example.com", "garbage").await,
            Err(TlsError::Key(_))
        ));
    }
}
