//! Provider client capability
//!
//! Every backing infrastructure implements [`ProviderClient`]. The
//! orchestrator only talks to this trait, so it can run against
//! DigitalOcean or against the in-memory provider used for dry runs and
//! tests.

pub mod digitalocean;
pub mod memory;

pub use digitalocean::DigitalOceanClient;
pub use memory::InMemoryProvider;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::NodeSpec;

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

/// Opaque reference to a node created on a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle {
    /// Provider-assigned identifier
    pub id: String,
    /// Name the node was created with
    pub name: String,
}

/// Addressing state of a node as reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub public_address: Option<IpAddr>,
    pub private_address: Option<IpAddr>,
}

impl NodeStatus {
    /// A node is address-assigned once its public address is populated
    pub fn is_addressed(&self) -> bool {
        self.public_address.is_some()
    }

    /// The assigned addresses, once the public one is known
    pub fn assigned(&self) -> Option<AssignedAddresses> {
        self.public_address.map(|public| AssignedAddresses {
            public,
            private: self.private_address,
        })
    }
}

/// Addresses of a node the provider has finished addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedAddresses {
    pub public: IpAddr,
    pub private: Option<IpAddr>,
}

/// SSH key registered with a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
}

/// Everything a provider needs to create one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    pub spec: NodeSpec,
    /// Address chosen by the planner; providers that allocate their own ignore it
    pub planned_address: Option<Ipv4Addr>,
    pub region: String,
    pub size: String,
    pub image: String,
    pub tags: Vec<String>,
    pub user_data: Option<String>,
    pub key: KeyHandle,
}

/// Errors returned by provider clients
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node '{name}' rejected: {reason}")]
    Rejected { name: String, reason: String },
}

// ============================================================================
// SBIO: Trait for abstraction (allows fakes in tests)
// ============================================================================

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Issue a create request. Returns as soon as the provider accepts it.
    async fn create_node(&self, request: &NodeRequest) -> Result<NodeHandle, ProviderError>;

    /// Fetch the current addressing state of a node
    async fn get_node(&self, handle: &NodeHandle) -> Result<NodeStatus, ProviderError>;

    /// Reuse the key registered under `name`, or register `public_key` under it
    async fn ensure_key(&self, name: &str, public_key: &str) -> Result<KeyHandle, ProviderError>;

    /// Delete every node carrying `tag`
    async fn delete_nodes_by_tag(&self, tag: &str) -> Result<(), ProviderError>;

    /// Remove the key registered under `name`. Returns false if there was none.
    async fn delete_key(&self, name: &str) -> Result<bool, ProviderError>;
}

/// Which backing infrastructure to talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    DigitalOcean,
    Memory,
}

/// Build the provider client selected by configuration
pub fn build_provider(
    kind: ProviderKind,
    api_url: Option<&str>,
    token: &str,
) -> Arc<dyn ProviderClient> {
    match kind {
        ProviderKind::DigitalOcean => {
            let url = api_url.unwrap_or(digitalocean::DEFAULT_API_URL);
            Arc::new(DigitalOceanClient::new(url, token))
        }
        ProviderKind::Memory => Arc::new(InMemoryProvider::new()),
    }
}
