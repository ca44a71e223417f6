//! Readiness waiter
//!
//! Gates on SSH reachability: `await_reachable` returns only when every node
//! answered a probe, or fails naming the nodes that never did. Nodes are
//! probed concurrently with a bounded pool, each retrying on a fixed interval
//! until the shared deadline.

mod probe;

pub use probe::{AssumeReachable, ReachabilityProbe, SshCommandProbe, TcpBannerProbe};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provision::ProvisionedNode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("Nodes not reachable over SSH before the deadline: {}", nodes.join(", "))]
    Timeout { nodes: Vec<String> },

    #[error("Readiness wait cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub ssh_port: u16,
    /// Delay between attempts on one node
    pub retry_interval: Duration,
    /// Deadline for the whole wait
    pub timeout: Duration,
    pub parallelism: usize,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            ssh_port: 22,
            retry_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            parallelism: 4,
        }
    }
}

pub struct ReadinessWaiter {
    config: ReadinessConfig,
    probe: Arc<dyn ReachabilityProbe>,
}

impl ReadinessWaiter {
    pub fn new(config: ReadinessConfig, probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self { config, probe }
    }

    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// Block until every node is reachable, the deadline passes, or `cancel` fires
    pub async fn await_reachable(
        &self,
        cancel: &CancellationToken,
        nodes: &[&ProvisionedNode],
        ssh_key_path: &Path,
    ) -> Result<(), ReadinessError> {
        if nodes.is_empty() {
            return Ok(());
        }

        info!("Waiting for SSH on {} node(s)", nodes.len());
        let pending: DashSet<String> = nodes.iter().map(|n| n.hostname.clone()).collect();
        let pending = &pending;

        let all = stream::iter(nodes.iter().copied())
            .for_each_concurrent(self.config.parallelism.max(1), |node| async move {
                self.wait_for_node(node, ssh_key_path).await;
                pending.remove(&node.hostname);
            });

        tokio::select! {
            result = timeout(self.config.timeout, all) => {
                if result.is_err() {
                    let mut nodes: Vec<String> = pending.iter().map(|n| n.key().clone()).collect();
                    nodes.sort();
                    warn!("SSH still unreachable on: {}", nodes.join(", "));
                    return Err(ReadinessError::Timeout { nodes });
                }
            }
            _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
        }

        info!("All {} node(s) reachable", nodes.len());
        Ok(())
    }

    async fn wait_for_node(&self, node: &ProvisionedNode, key_path: &Path) {
        let mut attempt = 1u32;
        loop {
            match self.probe.probe(node, key_path, self.config.ssh_port).await {
                Ok(()) => {
                    debug!("{} reachable after {} attempt(s)", node.hostname, attempt);
                    return;
                }
                Err(reason) => {
                    debug!(
                        "{} ({}) not reachable yet: {}",
                        node.hostname, node.public_address, reason
                    );
                }
            }
            attempt += 1;
            sleep(self.config.retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeRole;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(name: &str) -> ProvisionedNode {
        ProvisionedNode {
            id: name.to_string(),
            hostname: name.to_string(),
            public_address: "203.0.113.9".parse().unwrap(),
            private_address: None,
            ssh_user: "root".to_string(),
            roles: NodeRole::WORKER,
            provisioned_at: Utc::now(),
        }
    }

    /// Fails the first `failures` attempts per node; nodes in `never` never succeed
    struct ScriptedProbe {
        failures: usize,
        never: Vec<String>,
        calls: DashSet<(String, usize)>,
        total: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(failures: usize, never: &[&str]) -> Self {
            Self {
                failures,
                never: never.iter().map(|s| s.to_string()).collect(),
                calls: DashSet::new(),
                total: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn probe(&self, node: &ProvisionedNode, _: &Path, _: u16) -> Result<(), String> {
            self.total.fetch_add(1, Ordering::SeqCst);
            if self.never.contains(&node.hostname) {
                return Err("refused".to_string());
            }
            let n = (0..)
                .find(|i| self.calls.insert((node.hostname.clone(), *i)))
                .unwrap_or(0);
            if n < self.failures {
                Err("refused".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn config() -> ReadinessConfig {
        ReadinessConfig {
            retry_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(300),
            ..ReadinessConfig::default()
        }
    }

    #[tokio::test]
    async fn test_waits_through_retries() {
        let probe = Arc::new(ScriptedProbe::new(2, &[]));
        let waiter = ReadinessWaiter::new(config(), probe.clone());
        let (a, b) = (node("etcd001"), node("master001"));

        waiter
            .await_reachable(&CancellationToken::new(), &[&a, &b], Path::new("k"))
            .await
            .unwrap();
        assert_eq!(probe.total.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_timeout_names_unreachable_nodes() {
        let probe = Arc::new(ScriptedProbe::new(0, &["worker002", "worker001"]));
        let waiter = ReadinessWaiter::new(config(), probe);
        let nodes = [node("etcd001"), node("worker001"), node("worker002")];
        let refs: Vec<&ProvisionedNode> = nodes.iter().collect();

        let err = waiter
            .await_reachable(&CancellationToken::new(), &refs, Path::new("k"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ReadinessError::Timeout {
                nodes: vec!["worker001".to_string(), "worker002".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_cancel() {
        let probe = Arc::new(ScriptedProbe::new(0, &["etcd001"]));
        let waiter = ReadinessWaiter::new(
            ReadinessConfig {
                timeout: Duration::from_secs(60),
                ..config()
            },
            probe,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let n = node("etcd001");
        let err = waiter
            .await_reachable(&cancel, &[&n], Path::new("k"))
            .await
            .unwrap_err();
        assert_eq!(err, ReadinessError::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_node_list() {
        let waiter = ReadinessWaiter::new(config(), Arc::new(AssumeReachable));
        assert!(waiter
            .await_reachable(&CancellationToken::new(), &[], Path::new("k"))
            .await
            .is_ok());
    }
}
