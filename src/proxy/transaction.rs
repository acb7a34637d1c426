//! Multi-node proxy transactions.
//!
//! A round opens one transaction per active proxy node, applies the same
//! mutations on every node and commits only if all of them succeeded
//! everywhere. Any failure deletes every open transaction, so a round either
//! commits on all reachable nodes or on none.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use super::{ProxyControl, ProxyError};

#[derive(Clone)]
pub struct ProxyNode {
    pub hostname: String,
    pub control: Arc<dyn ProxyControl>,
}

/// A change applied inside each node's transaction.
#[async_trait]
pub trait ProxyMutation: Send + Sync {
    async fn apply(&self, proxy: &dyn ProxyControl, transaction_id: &str)
    -> Result<(), ProxyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("no proxy node could open a transaction")]
    NoTransaction,
    #[error("proxy update failed on {node}: {source}")]
    Apply { node: String, source: ProxyError },
    #[error("round aborted after an earlier failure")]
    Aborted,
    #[error("commit failed on {node} after {committed} node(s) committed: {source}")]
    Commit {
        node: String,
        committed: usize,
        source: ProxyError,
    },
}

struct OpenTransaction {
    node: ProxyNode,
    id: String,
}

pub struct ProxyTransactionSet {
    open: Vec<OpenTransaction>,
    failed: bool,
}

impl ProxyTransactionSet {
    /// Opens a transaction on every node. Nodes that fail to open are left
    /// out of the round; the round fails only when none could open.
    pub async fn prepare_all(nodes: Vec<ProxyNode>) -> Result<Self, RoundError> {
        if nodes.is_empty() {
            return Ok(Self {
                open: Vec::new(),
                failed: false,
            });
        }
        let opened = join_all(nodes.into_iter().map(|node| async move {
            let result = node.control.fetch_new_transaction().await;
            (node, result)
        }))
        .await;

        let mut open = Vec::with_capacity(opened.len());
        for (node, result) in opened {
            match result {
                Ok(id) => {
                    log::debug!("Opened proxy transaction {id} on {}", node.hostname);
                    open.push(OpenTransaction { node, id });
                }
                Err(e) => log::warn!(
                    "Excluding {} from proxy round, transaction failed: {e}",
                    node.hostname
                ),
            }
        }
        if open.is_empty() {
            return Err(RoundError::NoTransaction);
        }
        Ok(Self {
            open,
            failed: false,
        })
    }

    /// Applies `mutation` on every node. After a failure the set only
    /// accepts `abort_all`, and `commit_all` aborts.
    pub async fn apply(&mut self, mutation: &dyn ProxyMutation) -> Result<(), RoundError> {
        if self.failed {
            return Err(RoundError::Aborted);
        }
        let results = join_all(
            self.open
                .iter()
                .map(|tx| mutation.apply(tx.node.control.as_ref(), &tx.id)),
        )
        .await;

        let mut first_error = None;
        for (tx, result) in self.open.iter().zip(results) {
            if let Err(e) = result {
                log::error!("Proxy update failed on {}: {e}", tx.node.hostname);
                first_error.get_or_insert(RoundError::Apply {
                    node: tx.node.hostname.clone(),
                    source: e,
                });
            }
        }
        match first_error {
            Some(e) => {
                self.failed = true;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Commits every node, or aborts all of them if any mutation failed.
    /// Returns how many nodes committed.
    pub async fn commit_all(mut self) -> Result<usize, RoundError> {
        if self.failed {
            self.abort_all().await;
            return Err(RoundError::Aborted);
        }
        let mut pending = std::mem::take(&mut self.open).into_iter();
        let mut committed = 0;
        while let Some(tx) = pending.next() {
            if let Err(e) = tx.node.control.commit_transaction(&tx.id).await {
                log::error!(
                    "Commit of {} failed on {}, aborting remaining nodes: {e}",
                    tx.id,
                    tx.node.hostname
                );
                let node = tx.node.hostname.clone();
                self.open = std::iter::once(tx).chain(pending).collect();
                self.abort_all().await;
                return Err(RoundError::Commit {
                    node,
                    committed,
                    source: e,
                });
            }
            committed += 1;
        }
        Ok(committed)
    }

    /// Deletes every open transaction.
    pub async fn abort_all(mut self) {
        let open = std::mem::take(&mut self.open);
        let results = join_all(open.iter().map(|tx| async move {
            (tx, tx.node.control.delete_transaction(&tx.id).await)
        }))
        .await;
        for (tx, result) in results {
            if let Err(e) = result {
                log::warn!(
                    "Failed to delete transaction {} on {}: {e}",
                    tx.id,
                    tx.node.hostname
                );
            }
        }
    }

    /// Opens, applies and commits in one go.
    pub async fn run(
        nodes: Vec<ProxyNode>,
        mutations: &[&dyn ProxyMutation],
    ) -> Result<usize, RoundError> {
        let mut set = Self::prepare_all(nodes).await?;
        for mutation in mutations {
            if let Err(e) = set.apply(*mutation).await {
                set.abort_all().await;
                return Err(e);
            }
        }
        set.commit_all().await
    }
}

impl Drop for ProxyTransactionSet {
    fn drop(&mut self) {
        if self.open.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!(
                "Dropping {} proxy transactions outside a runtime",
                self.open.len()
            );
            return;
        };
        for tx in std::mem::take(&mut self.open) {
            handle.spawn(async move {
                if let Err(e) = tx.node.control.delete_transaction(&tx.id).await {
                    log::warn!(
                        "Failed to clean up transaction {} on {}: {e}",
                        tx.id,
                        tx.node.hostname
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{BackendKey, ListenerMode};
    use crate::testing::FakeProxy;
    use std::time::Duration;

    struct LinkHttps;

    #[async_trait]
    impl ProxyMutation for LinkHttps {
        async fn apply(
            &self,
            proxy: &dyn ProxyControl,
            transaction_id: &str,
        ) -> Result<(), ProxyError> {
            let backend = BackendKey::new(ListenerMode::Http, "web", 8080);
            if !proxy.is_backend_exist(transaction_id, &backend).await? {
                proxy.add_backend(transaction_id, &backend, 1).await?;
            }
            proxy
                .add_https_link(transaction_id, &backend.name(), "app.example.com")
                .await
        }
    }

    fn node(proxy: &Arc<FakeProxy>) -> ProxyNode {
        ProxyNode {
            hostname: proxy.name().to_string(),
            control: proxy.clone(),
        }
    }

    #[tokio::test]
    async fn test_round_commits_every_node() {
        let a = FakeProxy::new("proxy-a");
        let b = FakeProxy::new("proxy-b");
        let committed = ProxyTransactionSet::run(vec![node(&a), node(&b)], &[&LinkHttps])
            .await
            .unwrap();
        assert_eq!(committed, 2);
        for proxy in [&a, &b] {
            assert_eq!(proxy.count("commit_transaction"), 1);
            assert_eq!(proxy.count("delete_transaction"), 0);
            assert_eq!(proxy.count("add_https_link"), 1);
        }
    }

    #[tokio::test]
    async fn test_failure_on_one_node_aborts_all() {
        let healthy = FakeProxy::new("proxy-a");
        let failing = FakeProxy::new("proxy-b");
        failing.fail_on("add_https_link");

        let err = ProxyTransactionSet::run(vec![node(&healthy), node(&failing)], &[&LinkHttps])
            .await
            .unwrap_err();
        assert!(matches!(err, RoundError::Apply { ref node, .. } if node == "proxy-b"));
        for proxy in [&healthy, &failing] {
            assert_eq!(proxy.count("commit_transaction"), 0);
            assert_eq!(proxy.count("delete_transaction"), 1);
        }
    }

    #[tokio::test]
    async fn test_commit_refused_after_failed_apply() {
        let a = FakeProxy::new("proxy-a");
        a.fail_on("add_backend");
        let mut set = ProxyTransactionSet::prepare_all(vec![node(&a)]).await.unwrap();
        assert!(set.apply(&LinkHttps).await.is_err());
        assert!(matches!(set.apply(&LinkHttps).await, Err(RoundError::Aborted)));
        assert!(matches!(set.commit_all().await, Err(RoundError::Aborted)));
        assert_eq!(a.count("commit_transaction"), 0);
        assert_eq!(a.count("delete_transaction"), 1);
    }

    #[tokio::test]
    async fn test_node_failing_to_open_is_excluded() {
        let up = FakeProxy::new("proxy-a");
        let down = FakeProxy::new("proxy-b");
        down.fail_on("fetch_new_transaction");

        let committed = ProxyTransactionSet::run(vec![node(&up), node(&down)], &[&LinkHttps])
            .await
            .unwrap();
        assert_eq!(committed, 1);
        assert_eq!(down.count("add_https_link"), 0);
    }

    #[tokio::test]
    async fn test_all_nodes_failing_to_open() {
        let down = FakeProxy::new("proxy-a");
        down.fail_on("fetch_new_transaction");
        assert!(matches!(
            ProxyTransactionSet::prepare_all(vec![node(&down)]).await,
            Err(RoundError::NoTransaction)
        ));
    }

    #[tokio::test]
    async fn test_no_nodes_is_vacuous_success() {
        assert_eq!(
            ProxyTransactionSet::run(Vec::new(), &[&LinkHttps]).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_commit_failure_aborts_remaining() {
        let first = FakeProxy::new("proxy-a");
        let second = FakeProxy::new("proxy-b");
        let third = FakeProxy::new("proxy-c");
        second.fail_on("commit_transaction");

        let err = ProxyTransactionSet::run(
            vec![node(&first), node(&second), node(&third)],
            &[&LinkHttps],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RoundError::Commit { committed: 1, .. }));
        assert_eq!(first.count("delete_transaction"), 0);
        assert_eq!(second.count("delete_transaction"), 1);
        assert_eq!(third.count("commit_transaction"), 0);
        assert_eq!(third.count("delete_transaction"), 1);
    }

    #[tokio::test]
    async fn test_drop_cleans_up_open_transactions() {
        let a = FakeProxy::new("proxy-a");
        {
            let mut set = ProxyTransactionSet::prepare_all(vec![node(&a)]).await.unwrap();
            set.apply(&LinkHttps).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.count("delete_transaction"), 1);
        assert_eq!(a.count("commit_transaction"), 0);
    }
}
