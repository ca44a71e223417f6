//! Command implementations for the CLI
//!
//! Commands return Results; printing is left to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{CreateArgs, DeleteAllArgs, TopologyArgs};
use crate::config::credentials::{self, CredentialError, SshKeyPair};
use crate::config::{ConfigError, Settings};
use crate::plan::{
    write_plan_file, ClusterPlanModel, PlanEmitter, PlanError, PlanOptions, PlanSerializer,
    YamlPlanSerializer,
};
use crate::provider::{build_provider, ProviderClient, ProviderError, ProviderKind};
use crate::provision::{
    ProvisionFailure, ProvisionOptions, ProvisionOrchestrator, ProvisionedCluster,
};
use crate::readiness::{
    AssumeReachable, ReachabilityProbe, ReadinessError, ReadinessWaiter, SshCommandProbe,
};
use crate::topology::{self, ClusterTopology, NodeRole, RoleCounts, TopologyError};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Provisioning failed: {0}")]
    Provision(#[from] Box<ProvisionFailure>),

    #[error("Readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// What `create` produced
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub cluster: ProvisionedCluster,
    /// Plan document, unless `--no-plan` was given
    pub plan: Option<ClusterPlanModel>,
    pub plan_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub tag: String,
    /// `Some(removed)` when key removal was requested
    pub key_removed: Option<bool>,
}

// ============================================================================
// Pure option building
// ============================================================================

pub fn role_counts(args: &CreateArgs) -> RoleCounts {
    RoleCounts::new()
        .with(NodeRole::ETCD, args.etcd)
        .with(NodeRole::MASTER, args.master)
        .with(NodeRole::WORKER, args.worker)
        .with(NodeRole::BOOTSTRAP, u16::from(args.bootstrap))
}

pub fn topology_counts(args: &TopologyArgs) -> RoleCounts {
    RoleCounts::new()
        .with(NodeRole::ETCD, args.etcd)
        .with(NodeRole::MASTER, args.master)
        .with(NodeRole::WORKER, args.worker)
        .with(NodeRole::INGRESS, args.ingress)
        .with(NodeRole::STORAGE, args.storage)
}

/// Merge settings and flags into provisioning options
pub fn provision_options(
    args: &CreateArgs,
    settings: &Settings,
    key: &SshKeyPair,
    bootstrap_user_data: Option<String>,
) -> ProvisionOptions {
    let base = settings.provision_options();
    ProvisionOptions {
        region: args.region.clone().unwrap_or(base.region),
        image: args.image.clone().unwrap_or(base.image),
        instance_size: args.instance_type.clone().unwrap_or(base.instance_size),
        worker_size: args.worker_type.clone().or(base.worker_size),
        cluster_tag: args.tag.clone().unwrap_or(base.cluster_tag),
        ssh_user: args.ssh_user.clone().unwrap_or(base.ssh_user),
        public_key: key.public_key.clone(),
        node_cidr: args.node_cidr.clone().or(base.node_cidr),
        overlap: args.overlap,
        bootstrap_user_data,
        parallelism: args.parallelism.unwrap_or(base.parallelism),
        address_timeout: args
            .address_timeout
            .map(Duration::from_secs)
            .unwrap_or(base.address_timeout),
        cleanup_on_failure: args.cleanup_on_failure,
        ..base
    }
}

/// Plan options; with a bootstrap node the key path points into its install dir
pub fn plan_options(
    args: &CreateArgs,
    opts: &ProvisionOptions,
    settings: &Settings,
    key: &SshKeyPair,
    install_dir: &str,
) -> PlanOptions {
    let ssh_key_path = if args.bootstrap {
        credentials::bootstrap_key_path(install_dir, &key.file_name())
    } else {
        key.private_path.display().to_string()
    };

    PlanOptions {
        ssh_user: opts.ssh_user.clone(),
        ssh_key_path,
        ssh_port: settings.ssh_port,
        load_balancer: args.load_balancer.clone(),
        storage: args.storage_cluster,
        admin_password: args.admin_password.clone(),
        ..PlanOptions::default()
    }
}

/// How to remove nodes a failed run left running
pub fn leftover_nodes_hint(count: usize, tag: &str) -> String {
    format!(
        "{} node(s) were left running; remove them with: clusterforge delete-all --tag {}",
        count, tag
    )
}

fn probe_for(kind: ProviderKind, dry_run: bool) -> Arc<dyn ReachabilityProbe> {
    if dry_run || kind == ProviderKind::Memory {
        Arc::new(AssumeReachable)
    } else {
        Arc::new(SshCommandProbe::default())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Provision, wait for SSH, then emit the plan
pub async fn run_create(
    args: &CreateArgs,
    settings: &Settings,
    cancel: &CancellationToken,
) -> CommandResult<CreateOutcome> {
    if let Some(env_file) = &args.env_file {
        credentials::load_env_file(env_file)?;
    }

    let kind = if args.dry_run {
        ProviderKind::Memory
    } else {
        settings.provider
    };
    let token = match kind {
        ProviderKind::DigitalOcean => credentials::api_token()?,
        ProviderKind::Memory => String::new(),
    };
    let key = match credentials::ssh_key_pair() {
        Ok(k) => k,
        Err(e) if kind == ProviderKind::Memory => {
            warn!("No SSH key pair ({}), continuing without one", e);
            SshKeyPair {
                private_path: PathBuf::from("ssh/cluster.pem"),
                public_key: String::new(),
            }
        }
        Err(e) => return Err(e.into()),
    };

    let install_dir = credentials::install_dir(&settings.install_dir);
    let user_data = match (&args.bootstrap_commands_file, args.bootstrap) {
        (Some(path), true) => Some(credentials::load_boot_script(path, &install_dir)?),
        (Some(_), false) => {
            warn!("--bootstrap-commands-file ignored without --bootstrap");
            None
        }
        (None, _) => None,
    };

    let provider = build_provider(kind, settings.api_url.as_deref(), &token);
    let opts = provision_options(args, settings, &key, user_data);
    let mut readiness = settings.readiness_config();
    if let Some(secs) = args.ssh_timeout {
        readiness.timeout = Duration::from_secs(secs);
    }
    readiness.parallelism = opts.parallelism;

    let orchestrator = ProvisionOrchestrator::new(provider);
    let cluster = match orchestrator.provision(cancel, &opts, &role_counts(args)).await {
        Ok(c) => c,
        Err(failure) => {
            if !failure.cleaned_up && !failure.partial.is_empty() {
                error!("{}", leftover_nodes_hint(failure.partial.len(), &opts.cluster_tag));
            }
            return Err(Box::new(failure).into());
        }
    };

    let waiter = ReadinessWaiter::new(readiness, probe_for(kind, args.dry_run));
    await_ready(&waiter, cancel, &cluster, &key.private_path, &opts.cluster_tag).await?;

    if args.no_plan {
        return Ok(CreateOutcome {
            cluster,
            plan: None,
            plan_path: None,
        });
    }

    let emitter = PlanEmitter::default();
    let plan = emitter.emit(&cluster, &plan_options(args, &opts, settings, &key, &install_dir))?;
    let serializer = YamlPlanSerializer;
    let rendered = emitter.render(&plan, &serializer)?;
    let path = write_plan_file(&args.out_dir, serializer.extension(), &rendered)?;

    Ok(CreateOutcome {
        cluster,
        plan: Some(plan),
        plan_path: Some(path),
    })
}

/// Wait for SSH on every node; on failure the nodes stay up and the hint says how to remove them
async fn await_ready(
    waiter: &ReadinessWaiter,
    cancel: &CancellationToken,
    cluster: &ProvisionedCluster,
    key_path: &Path,
    tag: &str,
) -> CommandResult<()> {
    if let Err(e) = waiter
        .await_reachable(cancel, &cluster.all_nodes(), key_path)
        .await
    {
        error!("{}", leftover_nodes_hint(cluster.len(), tag));
        return Err(e.into());
    }
    Ok(())
}

/// Delete tagged nodes and, optionally, the SSH key
pub async fn run_delete_all(args: &DeleteAllArgs, settings: &Settings) -> CommandResult<DeleteOutcome> {
    if let Some(env_file) = &args.env_file {
        credentials::load_env_file(env_file)?;
    }
    let token = match settings.provider {
        ProviderKind::DigitalOcean => credentials::api_token()?,
        ProviderKind::Memory => String::new(),
    };
    let provider = build_provider(settings.provider, settings.api_url.as_deref(), &token);
    delete_all(provider.as_ref(), args, settings).await
}

pub async fn delete_all(
    provider: &dyn ProviderClient,
    args: &DeleteAllArgs,
    settings: &Settings,
) -> CommandResult<DeleteOutcome> {
    let tag = args.tag.clone().unwrap_or_else(|| settings.cluster_tag.clone());
    provider.delete_nodes_by_tag(&tag).await?;
    info!("Deleted nodes tagged '{}'", tag);

    let key_removed = if args.remove_key {
        Some(provider.delete_key(&settings.key_name).await?)
    } else {
        None
    };

    Ok(DeleteOutcome { tag, key_removed })
}

pub fn run_topology(args: &TopologyArgs) -> CommandResult<ClusterTopology> {
    Ok(topology::plan(&topology_counts(args), &args.cidr, args.overlap)?)
}
