use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsStatus {
    #[default]
    None,
    Pending,
    Issued,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tls_status: TlsStatus,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub full_chain: String,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub issuer: String,
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
}

fn default_auto_renew() -> bool {
    true
}

impl Domain {
    /// No certificate authority can validate a bare address.
    pub fn is_ip_address(&self) -> bool {
        self.name.trim().parse::<IpAddr>().is_ok()
    }

    /// Whether the stored certificate expires within `days`.
    ///
    /// A domain without a recorded expiry always counts as expiring.
    pub fn expires_within(&self, days: i64, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now < chrono::Duration::days(days),
            None => true,
        }
    }
}
