pub mod cli;
pub mod config;
pub mod git;
pub mod logs;
pub mod model;
pub mod orchestrator;
pub mod proxy;
pub mod pubsub;
pub mod queue;
pub mod reconcile;
pub mod recovery;
pub mod renewal;
pub mod signals;
pub mod store;
pub mod tls;
pub mod worker;

#[cfg(test)]
mod testing;
