//! In-memory provider
//!
//! Keeps nodes and keys in process memory. Used by `create --dry-run` and by
//! tests, which can script create failures and address-assignment delays.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use super::{KeyHandle, NodeHandle, NodeRequest, NodeStatus, ProviderClient, ProviderError};

/// Public addresses are handed out from TEST-NET-3
const PUBLIC_BASE: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);
const PRIVATE_BASE: Ipv4Addr = Ipv4Addr::new(10, 133, 0, 2);

#[derive(Debug, Clone)]
struct MemoryNode {
    handle: NodeHandle,
    tags: Vec<String>,
    key: String,
    polls: u32,
    public: Ipv4Addr,
    private: Ipv4Addr,
}

pub struct InMemoryProvider {
    nodes: DashMap<String, MemoryNode>,
    keys: DashMap<String, KeyHandle>,
    next_id: AtomicU32,
    create_calls: AtomicUsize,
    get_calls: AtomicUsize,
    ensure_key_calls: AtomicUsize,
    /// 1-based create call indices that fail
    fail_calls: DashSet<usize>,
    fail_names: DashSet<String>,
    /// Number of `get_node` calls answered "pending" before addresses appear
    polls_until_address: u32,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            keys: DashMap::new(),
            next_id: AtomicU32::new(0),
            create_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            ensure_key_calls: AtomicUsize::new(0),
            fail_calls: DashSet::new(),
            fail_names: DashSet::new(),
            polls_until_address: 0,
        }
    }

    /// Fail the `n`th create call (1-based)
    pub fn fail_create_at(self, n: usize) -> Self {
        self.fail_calls.insert(n);
        self
    }

    /// Fail the create call for the node with this name
    pub fn fail_create_named(self, name: impl Into<String>) -> Self {
        self.fail_names.insert(name.into());
        self
    }

    /// Report nodes as pending for `polls` lookups before assigning addresses
    pub fn address_after_polls(mut self, polls: u32) -> Self {
        self.polls_until_address = polls;
        self
    }

    /// Never assign addresses
    pub fn never_assign_addresses(self) -> Self {
        self.address_after_polls(u32::MAX)
    }

    /// Register a key up front, as if left over from an earlier run
    pub fn with_existing_key(self, name: &str) -> Self {
        self.keys.insert(
            name.to_string(),
            KeyHandle {
                id: "existing".to_string(),
                name: name.to_string(),
                fingerprint: format!("fp:{}", name),
            },
        );
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn ensure_key_calls(&self) -> usize {
        self.ensure_key_calls.load(Ordering::SeqCst)
    }

    /// Names of live nodes, sorted
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .map(|n| n.handle.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of live nodes carrying `tag`
    pub fn count_tagged(&self, tag: &str) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.tags.iter().any(|t| t == tag))
            .count()
    }

    /// Key name a node was created with
    pub fn node_key(&self, name: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|n| n.handle.name == name)
            .map(|n| n.key.clone())
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    fn offset(base: Ipv4Addr, n: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(base).wrapping_add(n))
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for InMemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_node(&self, request: &NodeRequest) -> Result<NodeHandle, ProviderError> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let name = &request.spec.name;

        if self.fail_calls.contains(&call) || self.fail_names.contains(name) {
            return Err(ProviderError::Rejected {
                name: name.clone(),
                reason: format!("scripted failure on create call {}", call),
            });
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = NodeHandle {
            id: format!("mem-{}", seq + 1),
            name: name.clone(),
        };
        let node = MemoryNode {
            handle: handle.clone(),
            tags: request.tags.clone(),
            key: request.key.name.clone(),
            polls: 0,
            public: Self::offset(PUBLIC_BASE, seq),
            private: request
                .planned_address
                .unwrap_or_else(|| Self::offset(PRIVATE_BASE, seq)),
        };

        debug!("memory provider created {} as {}", name, handle.id);
        self.nodes.insert(handle.id.clone(), node);
        Ok(handle)
    }

    async fn get_node(&self, handle: &NodeHandle) -> Result<NodeStatus, ProviderError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        let mut node = self
            .nodes
            .get_mut(&handle.id)
            .ok_or_else(|| ProviderError::NodeNotFound(handle.name.clone()))?;

        if node.polls < self.polls_until_address {
            node.polls = node.polls.saturating_add(1);
            return Ok(NodeStatus::default());
        }

        Ok(NodeStatus {
            public_address: Some(IpAddr::V4(node.public)),
            private_address: Some(IpAddr::V4(node.private)),
        })
    }

    async fn ensure_key(&self, name: &str, _public_key: &str) -> Result<KeyHandle, ProviderError> {
        let call = self.ensure_key_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let key = self
            .keys
            .entry(name.to_string())
            .or_insert_with(|| KeyHandle {
                id: format!("key-{}", call),
                name: name.to_string(),
                fingerprint: format!("fp:{}", name),
            })
            .clone();
        Ok(key)
    }

    async fn delete_nodes_by_tag(&self, tag: &str) -> Result<(), ProviderError> {
        self.nodes.retain(|_, n| !n.tags.iter().any(|t| t == tag));
        Ok(())
    }

    async fn delete_key(&self, name: &str) -> Result<bool, ProviderError> {
        Ok(self.keys.remove(name).is_some())
    }
}
