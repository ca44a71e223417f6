//! Credential resolution
//!
//! Everything environment-dependent lives here: the env file, the API token,
//! the SSH key pair and the bootstrap script. The core only ever receives the
//! resolved values.

use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

/// Provider API token
pub const TOKEN_VAR: &str = "DO_API_TOKEN";
/// Path to the SSH private key
pub const KEY_PATH_VAR: &str = "DO_SECRET_ACCESS_KEY";
/// Installer directory override for the bootstrap node
pub const INSTALL_DIR_VAR: &str = "DO_KET_INSTALL_DIR";

/// Private key looked up next to the executable when no path is configured
const DEFAULT_KEY_FILE: &str = "ssh/cluster.pem";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to load env file {path}: {message}")]
    EnvFile { path: PathBuf, message: String },

    #[error("API token is required, set DO_API_TOKEN")]
    MissingToken,

    #[error("Private SSH key not found at {0}; create a key pair and point DO_SECRET_ACCESS_KEY at it")]
    KeyNotFound(PathBuf),

    #[error("Failed to read public key {path}: {source}")]
    PublicKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read boot script {path}: {source}")]
    BootScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot locate executable directory: {0}")]
    ExecutableDir(String),
}

/// A private key path and its public key material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    pub private_path: PathBuf,
    pub public_key: String,
}

impl SshKeyPair {
    /// File name of the private key, e.g. `cluster.pem`
    pub fn file_name(&self) -> String {
        self.private_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cluster.pem".to_string())
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Validate a raw token value, dropping stray carriage returns
pub fn parse_token(raw: Option<&str>) -> Result<String, CredentialError> {
    let token = raw.unwrap_or_default().replace('\r', "");
    let token = token.trim();
    if token.is_empty() {
        return Err(CredentialError::MissingToken);
    }
    Ok(token.to_string())
}

/// Configured key path, or `ssh/cluster.pem` under `exe_dir`
pub fn key_path(configured: Option<&str>, exe_dir: &Path) -> PathBuf {
    match configured.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => PathBuf::from(shellexpand::tilde(p).as_ref()),
        None => exe_dir.join(DEFAULT_KEY_FILE),
    }
}

/// `<private>.pub`
pub fn public_key_path(private: &Path) -> PathBuf {
    let mut name = private.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Boot script location: relative paths are taken from `exe_dir`
pub fn boot_script_path(path: &Path, exe_dir: &Path) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
    if expanded.is_absolute() {
        expanded
    } else {
        exe_dir.join(expanded)
    }
}

/// Key path as seen from the bootstrap node
pub fn bootstrap_key_path(install_dir: &str, key_file: &str) -> String {
    format!("{}/ssh/{}", install_dir.trim_end_matches('/'), key_file)
}

/// Prepare a bootstrap script for user data.
///
/// The `#!/bin/bash` shebang gains a prologue that creates and enters the
/// install directory; CRLF line endings become LF.
pub fn render_boot_script(script: &str, install_dir: &str) -> String {
    let prologue = format!("#!/bin/bash\nmkdir -p {dir}\ncd {dir} && ", dir = install_dir);
    let script = script.replace("#!/bin/bash", &prologue);
    match Regex::new(r"\r?\n") {
        Ok(re) => re.replace_all(&script, "\n").into_owned(),
        Err(_) => script.replace("\r\n", "\n"),
    }
}

// ============================================================================
// I/O
// ============================================================================

/// Load variables from an env file into the process environment
pub fn load_env_file(path: &Path) -> Result<(), CredentialError> {
    let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
    dotenvy::from_path(&expanded).map_err(|e| CredentialError::EnvFile {
        path: expanded.clone(),
        message: e.to_string(),
    })?;
    debug!("Loaded env file {}", expanded.display());
    Ok(())
}

pub fn api_token() -> Result<String, CredentialError> {
    parse_token(std::env::var(TOKEN_VAR).ok().as_deref())
}

/// Installer directory, honouring the environment override
pub fn install_dir(configured: &str) -> String {
    std::env::var(INSTALL_DIR_VAR)
        .ok()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| configured.to_string())
}

fn executable_dir() -> Result<PathBuf, CredentialError> {
    let exe = std::env::current_exe().map_err(|e| CredentialError::ExecutableDir(e.to_string()))?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| CredentialError::ExecutableDir(exe.display().to_string()))
}

/// Resolve the SSH key pair from the environment or the executable directory
pub fn ssh_key_pair() -> Result<SshKeyPair, CredentialError> {
    let configured = std::env::var(KEY_PATH_VAR).ok();
    let private = match configured.as_deref() {
        Some(p) if !p.trim().is_empty() => key_path(Some(p), Path::new(".")),
        _ => {
            let dir = executable_dir()?;
            info!("Trying to locate key in {}", dir.join("ssh").display());
            key_path(None, &dir)
        }
    };
    read_key_pair(&private)
}

/// Read the public half of a key pair
pub fn read_key_pair(private: &Path) -> Result<SshKeyPair, CredentialError> {
    if !private.is_file() {
        return Err(CredentialError::KeyNotFound(private.to_path_buf()));
    }
    let public_path = public_key_path(private);
    let public_key = std::fs::read_to_string(&public_path).map_err(|source| {
        CredentialError::PublicKey {
            path: public_path.clone(),
            source,
        }
    })?;

    Ok(SshKeyPair {
        private_path: private.to_path_buf(),
        public_key: public_key.trim().to_string(),
    })
}

/// Read and render the bootstrap script at `path`, resolved next to the executable
pub fn load_boot_script(path: &Path, install_dir: &str) -> Result<String, CredentialError> {
    let resolved = boot_script_path(path, &executable_dir()?);
    debug!("Reading boot script {}", resolved.display());
    let script = std::fs::read_to_string(&resolved).map_err(|source| {
        CredentialError::BootScript {
            path: resolved.clone(),
            source,
        }
    })?;
    Ok(render_boot_script(&script, install_dir))
}
