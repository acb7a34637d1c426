//! Persisted entities advanced by the controller.
//!
//! Every status and protocol field is a closed enum. The API layer creates
//! rows; workers only move them through their state machines.

pub mod application;
pub mod credential;
pub mod deployment;
pub mod domain;
pub mod rules;
pub mod server;

pub use application::{Application, DeploymentMode, VolumeBinding};
pub use credential::{GitCredential, RegistryCredential};
pub use deployment::{
    BuildSpec, Deployment, DeploymentLog, DeploymentStatus, GitSource, GitTransport, Replacement,
    Upstream, decide_replacement,
};
pub use domain::{Domain, TlsStatus};
pub use rules::{IngressRule, Protocol, RedirectProtocol, RedirectRule, RuleStatus};
pub use server::{ProxyConfig, ProxyRole, Server, ServerStatus, SwarmRole};
