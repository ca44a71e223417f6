//! Plan emission
//!
//! Assembles a [`ProvisionedCluster`] into the plan document consumed by the
//! installer. Assembly is pure; rendering is delegated to a
//! [`PlanSerializer`] and writing to [`write_plan_file`].

mod password;
mod serializer;

pub use password::{
    meets_policy, PasswordError, PasswordGenerator, RandomPasswordGenerator, FALLBACK_PASSWORD,
};
pub use serializer::{parse_plan, PlanSerializer, YamlPlanSerializer};

use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::provision::{ProvisionedCluster, ProvisionedNode};

/// Base name of written plan files
pub const PLAN_FILE_STEM: &str = "clusterforge-cluster";

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Cannot emit a plan without master nodes")]
    NoMasterNodes,

    #[error("Failed to serialize plan: {0}")]
    Serialize(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Plan document
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPlanModel {
    pub cluster: ClusterSection,
    pub etcd: NodeGroup,
    pub master: MasterGroup,
    pub worker: NodeGroup,
    pub ingress: NodeGroup,
    pub storage: NodeGroup,
    /// Degradations that happened while assembling; not rendered
    #[serde(skip)]
    pub warnings: Vec<PlanWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSection {
    pub name: String,
    pub admin_password: String,
    pub disable_package_installation: bool,
    pub networking: NetworkingSection,
    pub ssh: SshSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkingSection {
    pub pod_cidr_block: String,
    pub service_cidr_block: String,
    pub update_hosts_files: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSection {
    pub user: String,
    pub ssh_key: String,
    pub ssh_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub expected_count: usize,
    pub nodes: Vec<PlanNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterGroup {
    pub expected_count: usize,
    pub load_balanced_fqdn: String,
    pub load_balanced_short_name: String,
    pub nodes: Vec<PlanNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    pub host: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub internalip: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    /// The password generator failed and the fixed fallback was used
    WeakPasswordFallback(String),
}

impl ClusterPlanModel {
    /// Every host listed in any group, once, in group order
    pub fn hosts(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        [
            &self.etcd.nodes,
            &self.master.nodes,
            &self.worker.nodes,
            &self.ingress.nodes,
            &self.storage.nodes,
        ]
        .into_iter()
        .flatten()
        .map(|n| n.host.as_str())
        .filter(|h| seen.insert(*h))
        .collect()
    }
}

// ============================================================================
// Emitter
// ============================================================================

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub cluster_name: String,
    pub ssh_user: String,
    /// Key path as seen from wherever the installer runs
    pub ssh_key_path: String,
    pub ssh_port: u16,
    /// Load-balanced master endpoint; first master's address when unset
    pub load_balancer: Option<String>,
    /// Mirror workers into the storage group
    pub storage: bool,
    /// Use the first worker as ingress when no node carries the ingress role
    pub designate_ingress: bool,
    /// Skips the generator when set
    pub admin_password: Option<String>,
    pub pod_cidr: String,
    pub service_cidr: String,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            cluster_name: "kubernetes".to_string(),
            ssh_user: "root".to_string(),
            ssh_key_path: String::new(),
            ssh_port: 22,
            load_balancer: None,
            storage: false,
            designate_ingress: true,
            admin_password: None,
            pod_cidr: "172.16.0.0/16".to_string(),
            service_cidr: "172.20.0.0/16".to_string(),
        }
    }
}

pub struct PlanEmitter {
    passwords: Box<dyn PasswordGenerator>,
}

impl Default for PlanEmitter {
    fn default() -> Self {
        Self::new(Box::new(RandomPasswordGenerator::default()))
    }
}

impl PlanEmitter {
    pub fn new(passwords: Box<dyn PasswordGenerator>) -> Self {
        Self { passwords }
    }

    /// Assemble the plan model for a ready cluster
    pub fn emit(
        &self,
        cluster: &ProvisionedCluster,
        opts: &PlanOptions,
    ) -> Result<ClusterPlanModel, PlanError> {
        let first_master = cluster.master.first().ok_or(PlanError::NoMasterNodes)?;
        let mut warnings = Vec::new();

        let admin_password = match &opts.admin_password {
            Some(p) => p.clone(),
            None => match self.passwords.generate() {
                Ok(p) => p,
                Err(e) => {
                    warn!("Password generation failed ({}), using fallback password", e);
                    warnings.push(PlanWarning::WeakPasswordFallback(e.to_string()));
                    FALLBACK_PASSWORD.to_string()
                }
            },
        };

        let endpoint = opts
            .load_balancer
            .clone()
            .unwrap_or_else(|| first_master.public_address.to_string());

        let ingress: Vec<&ProvisionedNode> = if !cluster.ingress.is_empty() {
            cluster.ingress.iter().collect()
        } else if opts.designate_ingress {
            cluster.worker.iter().take(1).collect()
        } else {
            Vec::new()
        };

        let storage: Vec<&ProvisionedNode> = if opts.storage {
            dedup(cluster.storage.iter().chain(cluster.worker.iter()))
        } else {
            cluster.storage.iter().collect()
        };

        let master_nodes = plan_nodes(cluster.master.iter());
        let plan = ClusterPlanModel {
            cluster: ClusterSection {
                name: opts.cluster_name.clone(),
                admin_password,
                disable_package_installation: false,
                networking: NetworkingSection {
                    pod_cidr_block: opts.pod_cidr.clone(),
                    service_cidr_block: opts.service_cidr.clone(),
                    update_hosts_files: true,
                },
                ssh: SshSection {
                    user: opts.ssh_user.clone(),
                    ssh_key: opts.ssh_key_path.clone(),
                    ssh_port: opts.ssh_port,
                },
            },
            etcd: group(cluster.etcd.iter()),
            master: MasterGroup {
                expected_count: master_nodes.len(),
                load_balanced_fqdn: endpoint.clone(),
                load_balanced_short_name: endpoint,
                nodes: master_nodes,
            },
            worker: group(cluster.worker.iter()),
            ingress: group(ingress.into_iter()),
            storage: group(storage.into_iter()),
            warnings,
        };

        debug!(
            "Plan assembled: {} etcd, {} master, {} worker, {} ingress, {} storage",
            plan.etcd.expected_count,
            plan.master.expected_count,
            plan.worker.expected_count,
            plan.ingress.expected_count,
            plan.storage.expected_count
        );
        Ok(plan)
    }

    /// Render a plan through the given serializer
    pub fn render(
        &self,
        plan: &ClusterPlanModel,
        serializer: &dyn PlanSerializer,
    ) -> Result<String, PlanError> {
        serializer.serialize(plan)
    }
}

// ============================================================================
// SBIO: Pure helpers (no I/O)
// ============================================================================

fn plan_nodes<'a>(nodes: impl Iterator<Item = &'a ProvisionedNode>) -> Vec<PlanNode> {
    nodes
        .map(|n| PlanNode {
            host: n.hostname.clone(),
            ip: n.public_address.to_string(),
            internalip: n.private_address.map(|a| a.to_string()),
            labels: BTreeMap::new(),
        })
        .collect()
}

fn group<'a>(nodes: impl Iterator<Item = &'a ProvisionedNode>) -> NodeGroup {
    let nodes = plan_nodes(nodes);
    NodeGroup {
        expected_count: nodes.len(),
        nodes,
    }
}

fn dedup<'a>(nodes: impl Iterator<Item = &'a ProvisionedNode>) -> Vec<&'a ProvisionedNode> {
    let mut seen = HashSet::new();
    nodes.filter(|n| seen.insert(n.id.as_str())).collect()
}

/// File name for the `n`th plan in a directory: `stem.ext`, then `stem-1.ext`, ...
pub fn plan_file_name(n: u32, extension: &str) -> String {
    if n == 0 {
        format!("{}.{}", PLAN_FILE_STEM, extension)
    } else {
        format!("{}-{}.{}", PLAN_FILE_STEM, n, extension)
    }
}

// ============================================================================
// I/O
// ============================================================================

/// Write a rendered plan to the first free plan file name in `dir`.
///
/// Existing files are never overwritten.
pub fn write_plan_file(dir: &Path, extension: &str, contents: &str) -> Result<PathBuf, PlanError> {
    std::fs::create_dir_all(dir)?;

    for n in 0.. {
        let path = dir.join(plan_file_name(n, extension));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(contents.as_bytes())?;
                info!("Wrote plan to {}", path.display());
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(PlanError::Io(std::io::Error::new(
        ErrorKind::Other,
        "no free plan file name",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeRole;
    use chrono::Utc;

    fn node(id: &str, name: &str, public: &str, roles: NodeRole) -> ProvisionedNode {
        ProvisionedNode {
            id: id.to_string(),
            hostname: name.to_string(),
            public_address: public.parse().unwrap(),
            private_address: Some("10.0.0.2".parse().unwrap()),
            ssh_user: "root".to_string(),
            roles,
            provisioned_at: Utc::now(),
        }
    }

    fn cluster() -> ProvisionedCluster {
        let mut c = ProvisionedCluster::new();
        c.etcd.push(node("1", "etcd001", "203.0.113.1", NodeRole::ETCD));
        c.master.push(node("2", "master001", "203.0.113.2", NodeRole::MASTER));
        c.master.push(node("3", "master002", "203.0.113.3", NodeRole::MASTER));
        c.worker.push(node("4", "worker001", "203.0.113.4", NodeRole::WORKER));
        c.worker.push(node("5", "worker002", "203.0.113.5", NodeRole::WORKER));
        c
    }

    struct FailingGenerator;

    impl PasswordGenerator for FailingGenerator {
        fn generate(&self) -> Result<String, PasswordError> {
            Err(PasswordError::Exhausted(50))
        }
    }

    #[test]
    fn test_emit_lists_every_node_once() {
        let plan = PlanEmitter::default()
            .emit(&cluster(), &PlanOptions::default())
            .unwrap();

        assert_eq!(plan.etcd.expected_count, 1);
        assert_eq!(plan.master.expected_count, 2);
        assert_eq!(plan.worker.expected_count, 2);
        assert_eq!(
            plan.hosts(),
            vec!["etcd001", "master001", "master002", "worker001", "worker002"]
        );
        assert_eq!(plan.master.load_balanced_fqdn, "203.0.113.2");
        assert_eq!(plan.master.load_balanced_short_name, "203.0.113.2");
        assert_eq!(plan.cluster.admin_password.len(), 16);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_first_worker_designated_ingress() {
        let plan = PlanEmitter::default()
            .emit(&cluster(), &PlanOptions::default())
            .unwrap();
        assert_eq!(plan.ingress.expected_count, 1);
        assert_eq!(plan.ingress.nodes[0].host, "worker001");

        let opts = PlanOptions {
            designate_ingress: false,
            ..PlanOptions::default()
        };
        let plan = PlanEmitter::default().emit(&cluster(), &opts).unwrap();
        assert_eq!(plan.ingress.expected_count, 0);
    }

    #[test]
    fn test_storage_mirrors_workers() {
        let opts = PlanOptions {
            storage: true,
            ..PlanOptions::default()
        };
        let plan = PlanEmitter::default().emit(&cluster(), &opts).unwrap();
        let hosts: Vec<&str> = plan.storage.nodes.iter().map(|n| n.host.as_str()).collect();
        assert_eq!(hosts, vec!["worker001", "worker002"]);
    }

    #[test]
    fn test_explicit_load_balancer_and_password() {
        let opts = PlanOptions {
            load_balancer: Some("k8s.example.com".to_string()),
            admin_password: Some("s3cretPassw0rd".to_string()),
            ..PlanOptions::default()
        };
        let plan = PlanEmitter::new(Box::new(FailingGenerator))
            .emit(&cluster(), &opts)
            .unwrap();
        assert_eq!(plan.master.load_balanced_fqdn, "k8s.example.com");
        assert_eq!(plan.cluster.admin_password, "s3cretPassw0rd");
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_generator_failure_falls_back() {
        let plan = PlanEmitter::new(Box::new(FailingGenerator))
            .emit(&cluster(), &PlanOptions::default())
            .unwrap();
        assert_eq!(plan.cluster.admin_password, FALLBACK_PASSWORD);
        assert!(matches!(
            plan.warnings.as_slice(),
            [PlanWarning::WeakPasswordFallback(_)]
        ));
    }

    #[test]
    fn test_no_masters_is_an_error() {
        let mut c = cluster();
        c.master.clear();
        let result = PlanEmitter::default().emit(&c, &PlanOptions::default());
        assert!(matches!(result, Err(PlanError::NoMasterNodes)));
    }

    #[test]
    fn test_yaml_shape() {
        let emitter = PlanEmitter::default();
        let opts = PlanOptions {
            ssh_key_path: "/ket/ssh/cluster.pem".to_string(),
            ..PlanOptions::default()
        };
        let plan = emitter.emit(&cluster(), &opts).unwrap();
        let yaml = emitter.render(&plan, &YamlPlanSerializer).unwrap();

        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(doc["cluster"]["name"].as_str(), Some("kubernetes"));
        assert_eq!(doc["cluster"]["ssh"]["ssh_key"].as_str(), Some("/ket/ssh/cluster.pem"));
        assert_eq!(doc["cluster"]["ssh"]["ssh_port"].as_u64(), Some(22));
        assert_eq!(doc["master"]["expected_count"].as_u64(), Some(2));
        assert_eq!(doc["etcd"]["nodes"][0]["host"].as_str(), Some("etcd001"));
        assert_eq!(doc["etcd"]["nodes"][0]["internalip"].as_str(), Some("10.0.0.2"));
        assert!(doc["etcd"]["nodes"][0]["labels"].as_mapping().unwrap().is_empty());
        assert!(doc.get("warnings").is_none());

        let parsed = parse_plan(&yaml).unwrap();
        assert_eq!(parsed.hosts(), plan.hosts());
    }

    #[test]
    fn test_plan_file_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();

        let first = write_plan_file(dir.path(), "yaml", "a: 1\n").unwrap();
        let second = write_plan_file(dir.path(), "yaml", "a: 2\n").unwrap();
        let third = write_plan_file(dir.path(), "yaml", "a: 3\n").unwrap();

        assert_eq!(first.file_name().unwrap(), "clusterforge-cluster.yaml");
        assert_eq!(second.file_name().unwrap(), "clusterforge-cluster-1.yaml");
        assert_eq!(third.file_name().unwrap(), "clusterforge-cluster-2.yaml");
        assert_eq!(std::fs::read_to_string(first).unwrap(), "a: 1\n");
    }
}
