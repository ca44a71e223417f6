//! Provisioning phases and the per-node state machine

use std::collections::BTreeMap;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::topology::NodeRole;

/// Creation phases, run strictly in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Etcd,
    Master,
    Worker,
    Bootstrap,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [Phase::Etcd, Phase::Master, Phase::Worker, Phase::Bootstrap];

    /// The first phase whose role the node carries
    pub fn of(roles: NodeRole) -> Phase {
        if roles.contains(NodeRole::ETCD) {
            Phase::Etcd
        } else if roles.contains(NodeRole::MASTER) {
            Phase::Master
        } else if roles.intersects(NodeRole::WORKER | NodeRole::INGRESS | NodeRole::STORAGE) {
            Phase::Worker
        } else {
            Phase::Bootstrap
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Etcd => "etcd",
            Phase::Master => "master",
            Phase::Worker => "worker",
            Phase::Bootstrap => "bootstrap",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single node during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Requested,
    Creating,
    AddressPending,
    AddressAssigned,
    CreateFailed,
}

impl NodeState {
    pub fn can_advance_to(self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Requested, NodeState::Creating)
                | (NodeState::Creating, NodeState::AddressPending)
                | (NodeState::Creating, NodeState::CreateFailed)
                | (NodeState::AddressPending, NodeState::AddressAssigned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::AddressAssigned | NodeState::CreateFailed)
    }
}

/// Per-node states for one run, shared with the phase tasks
#[derive(Debug, Default)]
pub struct NodeTracker {
    states: DashMap<String, NodeState>,
}

impl NodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, name: &str) {
        self.states.insert(name.to_string(), NodeState::Requested);
    }

    /// Move a node to `next`, refusing illegal transitions
    pub fn transition(&self, name: &str, next: NodeState) -> bool {
        let Some(mut state) = self.states.get_mut(name) else {
            warn!("State transition for unknown node {}", name);
            return false;
        };
        if !state.can_advance_to(next) {
            warn!("Refusing transition {:?} -> {:?} for {}", *state, next, name);
            return false;
        }
        debug!("{}: {:?} -> {:?}", name, *state, next);
        *state = next;
        true
    }

    pub fn get(&self, name: &str) -> Option<NodeState> {
        self.states.get(name).map(|s| *s)
    }

    pub fn snapshot(&self) -> BTreeMap<String, NodeState> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}
