pub mod credentials;

pub use credentials::{
    bootstrap_key_path, load_boot_script, render_boot_script, CredentialError, SshKeyPair,
};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::provider::ProviderKind;
use crate::provision::ProvisionOptions;
use crate::readiness::ReadinessConfig;

/// Default settings location: ~/.clusterforge/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clusterforge")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Persistent defaults for every command. CLI flags override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider: ProviderKind,
    /// Provider API base URL; the provider's public endpoint when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub region: String,
    pub image: String,
    pub instance_size: String,
    pub worker_size: String,
    pub cluster_tag: String,
    pub ssh_user: String,
    pub key_name: String,
    pub node_cidr: String,
    pub poll_interval_secs: u64,
    pub address_timeout_secs: u64,
    pub ssh_retry_secs: u64,
    pub ssh_timeout_secs: u64,
    pub ssh_port: u16,
    pub parallelism: usize,
    /// Installer directory on the bootstrap node
    pub install_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::DigitalOcean,
            api_url: None,
            region: "tor1".to_string(),
            image: "ubuntu-16-04-x64".to_string(),
            instance_size: "1gb".to_string(),
            worker_size: "4gb".to_string(),
            cluster_tag: "clusterforge".to_string(),
            ssh_user: "root".to_string(),
            key_name: "clusterforge-key".to_string(),
            node_cidr: "10.0.0.0/16".to_string(),
            poll_interval_secs: 3,
            address_timeout_secs: 600,
            ssh_retry_secs: 5,
            ssh_timeout_secs: 600,
            ssh_port: 22,
            parallelism: 4,
            install_dir: "/ket".to_string(),
        }
    }
}

impl Settings {
    /// Provisioning options seeded from these settings
    pub fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            region: self.region.clone(),
            image: self.image.clone(),
            instance_size: self.instance_size.clone(),
            worker_size: Some(self.worker_size.clone()),
            cluster_tag: self.cluster_tag.clone(),
            ssh_user: self.ssh_user.clone(),
            key_name: self.key_name.clone(),
            node_cidr: Some(self.node_cidr.clone()),
            parallelism: self.parallelism,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            address_timeout: Duration::from_secs(self.address_timeout_secs),
            ..ProvisionOptions::default()
        }
    }

    pub fn readiness_config(&self) -> ReadinessConfig {
        ReadinessConfig {
            ssh_port: self.ssh_port,
            retry_interval: Duration::from_secs(self.ssh_retry_secs),
            timeout: Duration::from_secs(self.ssh_timeout_secs),
            parallelism: self.parallelism,
        }
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

pub fn serialize_settings(settings: &Settings) -> Result<String, ConfigError> {
    serde_yaml::to_string(settings).map_err(|e| ConfigError::WriteError(e.to_string()))
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

/// Load settings from `path`, or from the default location.
///
/// A missing default file yields defaults; an explicitly named file must exist.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let (path, explicit) = match path {
        Some(p) => (PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()), true),
        None => (default_config_path(), false),
    };

    if !path.exists() {
        if explicit {
            return Err(ConfigError::NotFound(path));
        }
        debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    debug!("Loading settings from {}", path.display());
    let content = std::fs::read_to_string(&path)?;
    parse_settings(&content)
}
