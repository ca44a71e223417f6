//! CLI module for clusterforge
//!
//! Subcommands:
//! - `clusterforge create` - Provision a cluster and write its plan
//! - `clusterforge delete-all` - Delete every node carrying the cluster tag
//! - `clusterforge topology` - Preview node names and addresses for role counts

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "clusterforge")]
#[command(about = "Provision cluster nodes on a cloud provider and emit an install plan")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to settings file (default: ~/.clusterforge/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision infrastructure for a new cluster
    Create(CreateArgs),

    /// Delete all nodes tagged for a cluster
    DeleteAll(DeleteAllArgs),

    /// Show the planned topology without provisioning anything
    Topology(TopologyArgs),
}

/// Arguments for the create command
#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Number of etcd nodes
    #[arg(short, long, default_value_t = 1)]
    pub etcd: u16,

    /// Number of master nodes
    #[arg(short, long, default_value_t = 1)]
    pub master: u16,

    /// Number of worker nodes
    #[arg(short, long, default_value_t = 1)]
    pub worker: u16,

    /// Let one node carry several roles
    #[arg(long)]
    pub overlap: bool,

    /// Instance size for etcd, master and bootstrap nodes
    #[arg(short = 'i', long)]
    pub instance_type: Option<String>,

    /// Instance size for worker nodes
    #[arg(long)]
    pub worker_type: Option<String>,

    /// Image slug
    #[arg(long)]
    pub image: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    /// Tag applied to every node, used by delete-all
    #[arg(long)]
    pub tag: Option<String>,

    /// User for SSH access to the nodes
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// Add a bootstrap node for running the installer
    #[arg(long)]
    pub bootstrap: bool,

    /// Script run on the bootstrap node at first boot (relative paths are
    /// resolved against the directory holding the clusterforge executable)
    #[arg(long, value_name = "FILE")]
    pub bootstrap_commands_file: Option<PathBuf>,

    /// Create a storage cluster from all worker nodes
    #[arg(short = 's', long)]
    pub storage_cluster: bool,

    /// Print the nodes instead of writing a plan file
    #[arg(short = 'n', long)]
    pub no_plan: bool,

    /// CIDR block for planned node addresses
    #[arg(long)]
    pub node_cidr: Option<String>,

    /// Maximum concurrent creates and polls per phase
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Seconds to wait for each node's address
    #[arg(long, value_name = "SECS")]
    pub address_timeout: Option<u64>,

    /// Seconds to wait for SSH on all nodes
    #[arg(long, value_name = "SECS")]
    pub ssh_timeout: Option<u64>,

    /// Load-balanced master endpoint (default: first master's address)
    #[arg(long)]
    pub load_balancer: Option<String>,

    /// Admin password for the plan (default: generated)
    #[arg(long)]
    pub admin_password: Option<String>,

    /// Delete tagged nodes if provisioning fails
    #[arg(long)]
    pub cleanup_on_failure: bool,

    /// Use the in-memory provider and skip SSH checks
    #[arg(long)]
    pub dry_run: bool,

    /// Directory for the plan file
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub out_dir: PathBuf,

    /// Path to a .env file with provider credentials
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

/// Arguments for the delete-all command
#[derive(Args, Debug, Clone)]
pub struct DeleteAllArgs {
    /// Tag whose nodes are deleted (default: from settings)
    #[arg(long)]
    pub tag: Option<String>,

    /// Also remove the SSH key from the provider
    #[arg(long)]
    pub remove_key: bool,

    /// Path to a .env file with provider credentials
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

/// Arguments for the topology command
#[derive(Args, Debug, Clone)]
pub struct TopologyArgs {
    #[arg(long, default_value_t = 1)]
    pub etcd: u16,

    #[arg(long, default_value_t = 1)]
    pub master: u16,

    #[arg(long, default_value_t = 1)]
    pub worker: u16,

    #[arg(long, default_value_t = 0)]
    pub ingress: u16,

    #[arg(long, default_value_t = 0)]
    pub storage: u16,

    #[arg(long, default_value = "192.168.42.0/24")]
    pub cidr: String,

    #[arg(long)]
    pub overlap: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_defaults() {
        let cli = Cli::parse_from(["clusterforge", "create"]);
        match cli.command {
            Commands::Create(args) => {
                assert_eq!((args.etcd, args.master, args.worker), (1, 1, 1));
                assert!(!args.bootstrap);
                assert!(!args.dry_run);
                assert_eq!(args.out_dir, PathBuf::from("."));
                assert!(args.instance_type.is_none());
            }
            _ => panic!("Expected Create command"),
        }
    }

    #[test]
    fn test_parse_create_flags() {
        let cli = Cli::parse_from([
            "clusterforge",
            "-vv",
            "create",
            "-e",
            "3",
            "-m",
            "2",
            "-w",
            "4",
            "-i",
            "2gb",
            "--worker-type",
            "8gb",
            "-s",
            "-n",
            "--bootstrap",
            "--address-timeout",
            "120",
            "--cleanup-on-failure",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Create(args) => {
                assert_eq!((args.etcd, args.master, args.worker), (3, 2, 4));
                assert_eq!(args.instance_type.as_deref(), Some("2gb"));
                assert_eq!(args.worker_type.as_deref(), Some("8gb"));
                assert!(args.storage_cluster);
                assert!(args.no_plan);
                assert!(args.bootstrap);
                assert_eq!(args.address_timeout, Some(120));
                assert!(args.cleanup_on_failure);
            }
            _ => panic!("Expected Create command"),
        }
    }

    #[test]
    fn test_parse_delete_all() {
        let cli = Cli::parse_from(["clusterforge", "delete-all", "--tag", "blue", "--remove-key"]);
        match cli.command {
            Commands::DeleteAll(args) => {
                assert_eq!(args.tag.as_deref(), Some("blue"));
                assert!(args.remove_key);
            }
            _ => panic!("Expected DeleteAll command"),
        }
    }

    #[test]
    fn test_parse_topology() {
        let cli = Cli::parse_from(["clusterforge", "topology", "--overlap", "--ingress", "1"]);
        match cli.command {
            Commands::Topology(args) => {
                assert!(args.overlap);
                assert_eq!(args.ingress, 1);
                assert_eq!(args.cidr, "192.168.42.0/24");
            }
            _ => panic!("Expected Topology command"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["clusterforge", "topology", "--config", "/tmp/cf.yaml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/cf.yaml")));
    }
}
