//! Provisioned nodes grouped by role

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::topology::NodeRole;

/// A node the provider has created and addressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedNode {
    /// Provider identifier
    pub id: String,
    pub hostname: String,
    pub public_address: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_address: Option<IpAddr>,
    pub ssh_user: String,
    /// Copied from the originating node spec, never re-derived from the provider
    pub roles: NodeRole,
    pub provisioned_at: DateTime<Utc>,
}

/// Provisioned nodes grouped by role.
///
/// A node carrying several roles appears in several groups. Storage and
/// ingress groups only hold nodes that explicitly carry those roles; the plan
/// emitter derives the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedCluster {
    pub etcd: Vec<ProvisionedNode>,
    pub master: Vec<ProvisionedNode>,
    pub worker: Vec<ProvisionedNode>,
    pub bootstrap: Vec<ProvisionedNode>,
    pub ingress: Vec<ProvisionedNode>,
    pub storage: Vec<ProvisionedNode>,
}

impl ProvisionedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed node to every group its roles select
    pub(crate) fn record(&mut self, node: ProvisionedNode) {
        let groups = [
            (NodeRole::ETCD, &mut self.etcd),
            (NodeRole::MASTER, &mut self.master),
            (NodeRole::WORKER, &mut self.worker),
            (NodeRole::BOOTSTRAP, &mut self.bootstrap),
            (NodeRole::INGRESS, &mut self.ingress),
            (NodeRole::STORAGE, &mut self.storage),
        ];
        for (role, group) in groups {
            if node.roles.contains(role) {
                group.push(node.clone());
            }
        }
    }

    /// Every distinct node, in group order
    pub fn all_nodes(&self) -> Vec<&ProvisionedNode> {
        let mut seen = HashSet::new();
        [
            &self.etcd,
            &self.master,
            &self.worker,
            &self.ingress,
            &self.storage,
            &self.bootstrap,
        ]
        .into_iter()
        .flatten()
        .filter(|n| seen.insert(n.id.as_str()))
        .collect()
    }

    /// Number of distinct nodes
    pub fn len(&self) -> usize {
        self.all_nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, roles: NodeRole) -> ProvisionedNode {
        ProvisionedNode {
            id: id.to_string(),
            hostname: format!("host-{}", id),
            public_address: "203.0.113.1".parse().unwrap(),
            private_address: None,
            ssh_user: "root".to_string(),
            roles,
            provisioned_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_groups_by_role() {
        let mut cluster = ProvisionedCluster::new();
        cluster.record(node("1", NodeRole::ETCD));
        cluster.record(node("2", NodeRole::WORKER | NodeRole::INGRESS));
        cluster.record(node("3", NodeRole::BOOTSTRAP));

        assert_eq!(cluster.etcd.len(), 1);
        assert_eq!(cluster.worker.len(), 1);
        assert_eq!(cluster.ingress.len(), 1);
        assert_eq!(cluster.bootstrap.len(), 1);
        assert!(cluster.master.is_empty());
        assert_eq!(cluster.len(), 3);
    }

    #[test]
    fn test_all_nodes_deduplicates_composites() {
        let mut cluster = ProvisionedCluster::new();
        cluster.record(node(
            "1",
            NodeRole::ETCD | NodeRole::MASTER | NodeRole::WORKER | NodeRole::INGRESS,
        ));

        assert_eq!(cluster.etcd.len(), 1);
        assert_eq!(cluster.master.len(), 1);
        assert_eq!(cluster.all_nodes().len(), 1);
        assert!(!cluster.is_empty());
    }
}
