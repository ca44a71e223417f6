//! Topology planning
//!
//! Turns desired role counts and a CIDR block into an ordered list of nodes,
//! each with a name, a role set, and an address. Planning is a pure
//! computation: identical inputs always produce identical topologies.
//!
//! Nodes are allocated in "waves". Wave `j` contains one node for every role
//! whose requested count is at least `j`. In overlap mode all qualifying roles
//! of a wave collapse into a single composite node named `node{j:03}`.

mod address;

pub use address::{next_node_address, parse_network};

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name used for composite nodes in overlap mode
pub const COMPOSITE_NODE_NAME: &str = "node";

bitflags::bitflags! {
    /// Roles a node can carry. A node may hold several at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct NodeRole: u32 {
        const ETCD = 1 << 0;
        const MASTER = 1 << 1;
        const WORKER = 1 << 2;
        const INGRESS = 1 << 3;
        const BOOTSTRAP = 1 << 4;
        const STORAGE = 1 << 5;
    }
}

impl NodeRole {
    /// Single roles in wave order
    pub const ORDERED: [NodeRole; 6] = [
        NodeRole::ETCD,
        NodeRole::MASTER,
        NodeRole::WORKER,
        NodeRole::INGRESS,
        NodeRole::STORAGE,
        NodeRole::BOOTSTRAP,
    ];

    /// Lowercase name of a single role, `None` for empty or composite sets
    pub fn name(self) -> Option<&'static str> {
        match self {
            r if r == NodeRole::ETCD => Some("etcd"),
            r if r == NodeRole::MASTER => Some("master"),
            r if r == NodeRole::WORKER => Some("worker"),
            r if r == NodeRole::INGRESS => Some("ingress"),
            r if r == NodeRole::BOOTSTRAP => Some("bootstrap"),
            r if r == NodeRole::STORAGE => Some("storage"),
            _ => None,
        }
    }

    /// Whether this role may be merged into a composite node
    fn overlaps(self) -> bool {
        self != NodeRole::BOOTSTRAP
    }

    /// Single-role names of this set, in wave order
    pub fn names(self) -> Vec<&'static str> {
        Self::ORDERED
            .iter()
            .filter(|r| self.contains(**r))
            .filter_map(|r| r.name())
            .collect()
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}

/// Errors raised while planning a topology
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Invalid network CIDR: {0}")]
    InvalidNetwork(String),

    #[error("Address space exhausted: requested nodes do not fit in {network}")]
    AddressSpaceExhausted { network: Ipv4Net },
}

/// Requested node count per role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    counts: [u16; 6],
}

impl RoleCounts {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(role: NodeRole) -> Option<usize> {
        NodeRole::ORDERED.iter().position(|r| *r == role)
    }

    /// Set the count for a single role. Composite sets are ignored.
    pub fn with(mut self, role: NodeRole, count: u16) -> Self {
        self.set(role, count);
        self
    }

    pub fn set(&mut self, role: NodeRole, count: u16) {
        if let Some(i) = Self::index(role) {
            self.counts[i] = count;
        }
    }

    pub fn get(&self, role: NodeRole) -> u16 {
        Self::index(role).map(|i| self.counts[i]).unwrap_or(0)
    }

    /// Sum of all role counts (dedicated-node count in non-overlap mode)
    pub fn total(&self) -> u32 {
        self.counts.iter().map(|c| u32::from(*c)).sum()
    }

    fn max(&self) -> u16 {
        self.counts.iter().copied().max().unwrap_or(0)
    }
}

/// A planned node, immutable once produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Roles carried by this node
    pub roles: NodeRole,
    /// Wave index, starting at 1
    pub ordinal: u16,
    /// Generated name, e.g. `etcd001`
    pub name: String,
}

impl NodeSpec {
    fn new(roles: NodeRole, ordinal: u16, base: &str) -> Self {
        Self {
            roles,
            ordinal,
            name: format!("{}{:03}", base, ordinal),
        }
    }
}

/// A planned node with its assigned address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyNode {
    #[serde(flatten)]
    pub spec: NodeSpec,
    pub address: Ipv4Addr,
}

/// Result of planning: the network and its nodes in allocation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub network: Ipv4Net,
    pub broadcast: Ipv4Addr,
    pub nodes: Vec<TopologyNode>,
}

impl ClusterTopology {
    /// Nodes carrying any of the given roles
    pub fn nodes_with(&self, role: NodeRole) -> impl Iterator<Item = &TopologyNode> {
        self.nodes
            .iter()
            .filter(move |n| n.spec.roles.intersects(role))
    }
}

// ============================================================================
// SBIO: Pure planning functions (no I/O)
// ============================================================================

/// Allocate names and role sets without addresses.
pub fn plan_roles(counts: &RoleCounts, overlap: bool) -> Vec<NodeSpec> {
    let mut specs = Vec::new();

    for wave in 1..=counts.max() {
        let mut composite = NodeRole::empty();

        for role in NodeRole::ORDERED {
            if counts.get(role) < wave {
                continue;
            }
            if overlap && role.overlaps() {
                composite |= role;
            } else if let Some(name) = role.name() {
                specs.push(NodeSpec::new(role, wave, name));
            }
        }

        if !composite.is_empty() {
            // Bootstrap is dedicated, so the composite goes in front of it
            let at = specs
                .iter()
                .position(|s| s.ordinal == wave && s.roles == NodeRole::BOOTSTRAP)
                .unwrap_or(specs.len());
            specs.insert(at, NodeSpec::new(composite, wave, COMPOSITE_NODE_NAME));
        }
    }

    specs
}

/// Plan a full topology: role allocation plus address assignment in `cidr`.
pub fn plan(
    counts: &RoleCounts,
    cidr: &str,
    overlap: bool,
) -> Result<ClusterTopology, TopologyError> {
    let network = parse_network(cidr)?;
    let mut nodes: Vec<TopologyNode> = Vec::new();

    for spec in plan_roles(counts, overlap) {
        let previous = nodes.last().map(|n| n.address);
        let address = next_node_address(&network, previous)?;
        nodes.push(TopologyNode { spec, address });
    }

    Ok(ClusterTopology {
        network,
        broadcast: network.broadcast(),
        nodes,
    })
}
