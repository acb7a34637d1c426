use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn is_http_family(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

impl AsRef<str> for Protocol {
    fn as_ref(&self) -> &str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Pending,
    Applied,
    Failed,
    Deleting,
}

impl AsRef<str> for RuleStatus {
    fn as_ref(&self) -> &str {
        match self {
            RuleStatus::Pending => "pending",
            RuleStatus::Applied => "applied",
            RuleStatus::Failed => "failed",
            RuleStatus::Deleting => "deleting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub id: String,
    pub application_id: String,
    #[serde(default)]
    pub domain_id: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
    pub target_port: u16,
    #[serde(default)]
    pub https_redirect: bool,
    pub status: RuleStatus,
}

impl IngressRule {
    /// Whether both rules are served by the same proxy backend.
    pub fn shares_backend(&self, other: &IngressRule) -> bool {
        self.application_id == other.application_id
            && self.target_port == other.target_port
            && self.protocol.is_http_family() == other.protocol.is_http_family()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectProtocol {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub id: String,
    pub domain_id: String,
    pub protocol: RedirectProtocol,
    pub redirect_url: String,
    pub status: RuleStatus,
}
