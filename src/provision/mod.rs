//! Provision orchestrator
//!
//! Turns role counts into real, addressed machines on a provider:
//! - plans node names, role sets and (optionally) addresses
//! - ensures the SSH key exists on the provider, once per run
//! - runs the Etcd, Master, Worker and Bootstrap phases in order; within a
//!   phase, creates fan out with bounded parallelism, then every created node
//!   is polled until the provider reports its public address
//!
//! A create failure stops the run: no new creates start and address polls
//! still running in that phase are abandoned. Nodes already created are left in place
//! unless cleanup-on-failure is requested; the partial cluster is returned
//! with the error for diagnostics and manual cleanup.

mod cluster;
mod state;

pub use cluster::{ProvisionedCluster, ProvisionedNode};
pub use state::{NodeState, NodeTracker, Phase};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::provider::{
    AssignedAddresses, KeyHandle, NodeHandle, NodeRequest, ProviderClient, ProviderError,
};
use crate::topology::{self, NodeRole, NodeSpec, RoleCounts, TopologyError};

/// Errors that abort a provisioning run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Timed out waiting for addresses on: {}", nodes.join(", "))]
    AddressTimeout { nodes: Vec<String> },

    #[error("Provisioning cancelled")]
    Cancelled,
}

/// A failed run: the error, whatever was provisioned before it, and node states
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct ProvisionFailure {
    #[source]
    pub error: ProvisionError,
    pub partial: ProvisionedCluster,
    pub node_states: BTreeMap<String, NodeState>,
    /// Whether cleanup-by-tag ran after the failure
    pub cleaned_up: bool,
}

/// Options for a provisioning run
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub region: String,
    pub image: String,
    pub instance_size: String,
    /// Size override for worker-phase nodes
    pub worker_size: Option<String>,
    pub cluster_tag: String,
    pub ssh_user: String,
    pub key_name: String,
    /// Public key material registered on the provider
    pub public_key: String,
    /// When set, the planner assigns addresses from this block
    pub node_cidr: Option<String>,
    pub overlap: bool,
    /// User data for the bootstrap node
    pub bootstrap_user_data: Option<String>,
    /// Maximum concurrent creates / polls within a phase
    pub parallelism: usize,
    pub poll_interval: Duration,
    /// Per-node limit on waiting for an address
    pub address_timeout: Duration,
    /// Consecutive lookup failures tolerated while polling
    pub max_poll_errors: u32,
    /// Delete everything carrying the cluster tag when the run fails
    pub cleanup_on_failure: bool,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            region: "tor1".to_string(),
            image: "ubuntu-16-04-x64".to_string(),
            instance_size: "1gb".to_string(),
            worker_size: None,
            cluster_tag: "clusterforge".to_string(),
            ssh_user: "root".to_string(),
            key_name: "clusterforge-key".to_string(),
            public_key: String::new(),
            node_cidr: None,
            overlap: false,
            bootstrap_user_data: None,
            parallelism: 4,
            poll_interval: Duration::from_secs(3),
            address_timeout: Duration::from_secs(600),
            max_poll_errors: 3,
            cleanup_on_failure: false,
        }
    }
}

impl ProvisionOptions {
    fn size_for(&self, phase: Phase) -> String {
        match (phase, &self.worker_size) {
            (Phase::Worker, Some(size)) => size.clone(),
            _ => self.instance_size.clone(),
        }
    }
}

/// Outcome of a single phase: completed nodes in plan order, plus the error that stopped it
struct PhaseOutcome {
    nodes: Vec<ProvisionedNode>,
    error: Option<ProvisionError>,
}

/// What happened to one node of a phase
enum NodeOutcome {
    Ready(ProvisionedNode),
    CreateFailed(ProviderError),
    AddressFailed(ProvisionError),
}

pub struct ProvisionOrchestrator {
    provider: Arc<dyn ProviderClient>,
}

impl ProvisionOrchestrator {
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }

    /// Provision every node the role counts ask for.
    ///
    /// Bootstrap counts above one are clamped to one.
    pub async fn provision(
        &self,
        cancel: &CancellationToken,
        opts: &ProvisionOptions,
        counts: &RoleCounts,
    ) -> Result<ProvisionedCluster, ProvisionFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("provision", %run_id, provider = self.provider.name());
        self.run(cancel, opts, counts).instrument(span).await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        opts: &ProvisionOptions,
        counts: &RoleCounts,
    ) -> Result<ProvisionedCluster, ProvisionFailure> {
        let tracker = NodeTracker::new();
        let mut cluster = ProvisionedCluster::new();

        let mut counts = *counts;
        if counts.get(NodeRole::BOOTSTRAP) > 1 {
            warn!("Only one bootstrap node is supported, clamping request");
            counts.set(NodeRole::BOOTSTRAP, 1);
        }

        let planned = match plan_requests(&counts, opts) {
            Ok(p) => p,
            Err(e) => return Err(self.fail(e.into(), cluster, &tracker, opts, false).await),
        };
        for (spec, _) in &planned {
            tracker.request(&spec.name);
        }
        info!("Planned {} node(s)", planned.len());

        let key = match self.ensure_key(opts).await {
            Ok(k) => k,
            Err(e) => return Err(self.fail(e.into(), cluster, &tracker, opts, false).await),
        };

        for phase in Phase::ORDER {
            let requests: Vec<(usize, NodeRequest)> = planned
                .iter()
                .enumerate()
                .filter(|(_, (spec, _))| Phase::of(spec.roles) == phase)
                .map(|(i, (spec, addr))| (i, build_request(spec, *addr, phase, opts, &key)))
                .collect();

            if requests.is_empty() {
                continue;
            }

            info!("Phase {}: creating {} node(s)", phase, requests.len());
            let outcome = self
                .run_phase(cancel, requests, opts, &tracker)
                .instrument(info_span!("phase", %phase))
                .await;

            for node in outcome.nodes {
                cluster.record(node);
            }

            if let Some(e) = outcome.error {
                error!("Phase {} failed: {}", phase, e);
                return Err(self.fail(e, cluster, &tracker, opts, true).await);
            }
        }

        info!("Provisioned {} node(s)", cluster.len());
        Ok(cluster)
    }

    /// Called once per run, before the first create
    async fn ensure_key(&self, opts: &ProvisionOptions) -> Result<KeyHandle, ProviderError> {
        let key = self
            .provider
            .ensure_key(&opts.key_name, &opts.public_key)
            .await?;
        debug!("Using key '{}' ({})", key.name, key.fingerprint);
        Ok(key)
    }

    async fn fail(
        &self,
        error: ProvisionError,
        partial: ProvisionedCluster,
        tracker: &NodeTracker,
        opts: &ProvisionOptions,
        provider_touched: bool,
    ) -> ProvisionFailure {
        let mut cleaned_up = false;
        if opts.cleanup_on_failure && provider_touched {
            warn!("Cleaning up nodes tagged '{}' after failure", opts.cluster_tag);
            match self.provider.delete_nodes_by_tag(&opts.cluster_tag).await {
                Ok(()) => cleaned_up = true,
                Err(e) => error!("Cleanup of tag '{}' failed: {}", opts.cluster_tag, e),
            }
        }

        ProvisionFailure {
            error,
            partial,
            node_states: tracker.snapshot(),
            cleaned_up,
        }
    }

    async fn run_phase(
        &self,
        cancel: &CancellationToken,
        requests: Vec<(usize, NodeRequest)>,
        opts: &ProvisionOptions,
        tracker: &NodeTracker,
    ) -> PhaseOutcome {
        let parallelism = opts.parallelism.max(1);
        let aborted = AtomicBool::new(false);
        let aborted = &aborted;
        // Fires on a create failure (or with the run token) and stops sibling polls
        let phase_cancel = cancel.child_token();
        let phase_cancel = &phase_cancel;

        // Each node is created and then polled. The first create failure stops
        // new creates; in-flight creates finish but are not waited on for addresses.
        let mut outcomes: Vec<(usize, NodeOutcome)> = stream::iter(requests)
            .map(|(idx, req)| async move {
                if aborted.load(Ordering::SeqCst) || phase_cancel.is_cancelled() {
                    return None;
                }
                tracker.transition(&req.spec.name, NodeState::Creating);

                let created = tokio::select! {
                    r = self.provider.create_node(&req) => r,
                    _ = cancel.cancelled() => return None,
                };
                let handle = match created {
                    Ok(handle) => {
                        debug!("Created {} ({})", handle.name, handle.id);
                        tracker.transition(&req.spec.name, NodeState::AddressPending);
                        handle
                    }
                    Err(e) => {
                        warn!("Create failed for {}: {}", req.spec.name, e);
                        tracker.transition(&req.spec.name, NodeState::CreateFailed);
                        aborted.store(true, Ordering::SeqCst);
                        phase_cancel.cancel();
                        return Some((idx, NodeOutcome::CreateFailed(e)));
                    }
                };

                let outcome = match self.wait_for_address(phase_cancel, &handle, opts).await {
                    Ok(addresses) => {
                        tracker.transition(&req.spec.name, NodeState::AddressAssigned);
                        NodeOutcome::Ready(provisioned_node(&req, &handle, addresses, opts))
                    }
                    Err(e) => NodeOutcome::AddressFailed(e),
                };
                Some((idx, outcome))
            })
            .buffer_unordered(parallelism)
            .filter_map(|r| async move { r })
            .collect()
            .await;
        outcomes.sort_by_key(|(idx, _)| *idx);

        let mut nodes = Vec::new();
        let mut create_error = None;
        let mut address_errors = Vec::new();
        for (_, outcome) in outcomes {
            match outcome {
                NodeOutcome::Ready(node) => nodes.push(node),
                NodeOutcome::CreateFailed(e) if create_error.is_none() => {
                    create_error = Some(ProvisionError::Provider(e));
                }
                NodeOutcome::CreateFailed(_) => {}
                NodeOutcome::AddressFailed(e) => address_errors.push(e),
            }
        }

        let error = create_error
            .or_else(|| merge_poll_errors(address_errors))
            .or_else(|| cancel.is_cancelled().then_some(ProvisionError::Cancelled));

        PhaseOutcome { nodes, error }
    }

    /// Poll the provider until the node has a public address.
    ///
    /// Bounded by the address timeout and the cancellation token.
    async fn wait_for_address(
        &self,
        cancel: &CancellationToken,
        handle: &NodeHandle,
        opts: &ProvisionOptions,
    ) -> Result<AssignedAddresses, ProvisionError> {
        debug!("Waiting for addresses on {}", handle.name);

        let poll = async {
            let mut consecutive_errors = 0u32;
            loop {
                match self.provider.get_node(handle).await {
                    Ok(status) => {
                        if let Some(addresses) = status.assigned() {
                            return Ok(addresses);
                        }
                        consecutive_errors = 0;
                        trace!("{} has no address yet", handle.name);
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= opts.max_poll_errors.max(1) {
                            return Err(ProvisionError::Provider(e));
                        }
                        debug!(
                            "Lookup of {} failed (attempt {}): {}",
                            handle.name, consecutive_errors, e
                        );
                    }
                }
                sleep(opts.poll_interval).await;
            }
        };

        tokio::select! {
            result = timeout(opts.address_timeout, poll) => match result {
                Ok(r) => r,
                Err(_) => {
                    warn!("No address for {} after {:?}", handle.name, opts.address_timeout);
                    Err(ProvisionError::AddressTimeout { nodes: vec![handle.name.clone()] })
                }
            },
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
        }
    }
}

// ============================================================================
// SBIO: Pure helpers (no I/O)
// ============================================================================

/// Plan names and role sets, attaching addresses when a CIDR is configured
fn plan_requests(
    counts: &RoleCounts,
    opts: &ProvisionOptions,
) -> Result<Vec<(NodeSpec, Option<std::net::Ipv4Addr>)>, TopologyError> {
    match &opts.node_cidr {
        Some(cidr) => Ok(topology::plan(counts, cidr, opts.overlap)?
            .nodes
            .into_iter()
            .map(|n| (n.spec, Some(n.address)))
            .collect()),
        None => Ok(topology::plan_roles(counts, opts.overlap)
            .into_iter()
            .map(|s| (s, None))
            .collect()),
    }
}

fn build_request(
    spec: &NodeSpec,
    planned_address: Option<std::net::Ipv4Addr>,
    phase: Phase,
    opts: &ProvisionOptions,
    key: &KeyHandle,
) -> NodeRequest {
    let user_data = match phase {
        Phase::Bootstrap => opts.bootstrap_user_data.clone(),
        _ => None,
    };
    NodeRequest {
        spec: spec.clone(),
        planned_address,
        region: opts.region.clone(),
        size: opts.size_for(phase),
        image: opts.image.clone(),
        tags: vec![opts.cluster_tag.clone()],
        user_data,
        key: key.clone(),
    }
}

fn provisioned_node(
    req: &NodeRequest,
    handle: &NodeHandle,
    addresses: AssignedAddresses,
    opts: &ProvisionOptions,
) -> ProvisionedNode {
    info!(
        "Address assigned to {}: public={} private={}",
        handle.name,
        addresses.public,
        addresses
            .private
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    ProvisionedNode {
        id: handle.id.clone(),
        hostname: handle.name.clone(),
        public_address: addresses.public,
        private_address: addresses.private,
        ssh_user: opts.ssh_user.clone(),
        roles: req.spec.roles,
        provisioned_at: Utc::now(),
    }
}

/// Collapse per-node poll failures into one error.
///
/// Provider errors win over timeouts; timeouts are merged so the error names
/// every node that never got an address.
fn merge_poll_errors(errors: Vec<ProvisionError>) -> Option<ProvisionError> {
    if let Some(e) = errors
        .iter()
        .find(|e| matches!(e, ProvisionError::Provider(_)))
    {
        return Some(e.clone());
    }

    let mut timed_out: Vec<String> = errors
        .iter()
        .filter_map(|e| match e {
            ProvisionError::AddressTimeout { nodes } => Some(nodes.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    if !timed_out.is_empty() {
        timed_out.sort();
        return Some(ProvisionError::AddressTimeout { nodes: timed_out });
    }

    errors.into_iter().next()
}
