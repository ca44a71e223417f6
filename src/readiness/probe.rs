//! Reachability probes

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::trace;

use crate::provision::ProvisionedNode;

/// One reachability attempt against a node
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Try once. `Err` carries a short reason for logs.
    async fn probe(&self, node: &ProvisionedNode, key_path: &Path, port: u16) -> Result<(), String>;
}

/// Connects to the SSH port and waits for the server's `SSH-` banner.
///
/// Does not authenticate, so the key path is unused.
#[derive(Debug, Clone)]
pub struct TcpBannerProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpBannerProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpBannerProbe {
    async fn probe(&self, node: &ProvisionedNode, _key_path: &Path, port: u16) -> Result<(), String> {
        let addr = (node.public_address, port);

        let mut stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| "connect timed out".to_string())?
            .map_err(|e| format!("connect failed: {}", e))?;

        let mut banner = [0u8; 4];
        timeout(self.connect_timeout, stream.read_exact(&mut banner))
            .await
            .map_err(|_| "no banner".to_string())?
            .map_err(|e| format!("read failed: {}", e))?;

        if &banner == b"SSH-" {
            Ok(())
        } else {
            Err(format!(
                "unexpected banner {:?}",
                String::from_utf8_lossy(&banner)
            ))
        }
    }
}

/// Runs `ssh ... true` against the node with the cluster key
#[derive(Debug, Clone)]
pub struct SshCommandProbe {
    pub program: String,
    pub connect_timeout: Duration,
}

impl Default for SshCommandProbe {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SshCommandProbe {
    fn args(&self, node: &ProvisionedNode, key_path: &Path, port: u16) -> Vec<String> {
        vec![
            "-i".to_string(),
            key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            port.to_string(),
            format!("{}@{}", node.ssh_user, node.public_address),
            "true".to_string(),
        ]
    }
}

#[async_trait]
impl ReachabilityProbe for SshCommandProbe {
    async fn probe(&self, node: &ProvisionedNode, key_path: &Path, port: u16) -> Result<(), String> {
        let args = self.args(node, key_path, port);
        trace!("{} {}", self.program, args.join(" "));

        let status = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.program, e))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!("ssh exited with {}", status))
        }
    }
}

/// Treats every node as reachable. Used for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeReachable;

#[async_trait]
impl ReachabilityProbe for AssumeReachable {
    async fn probe(&self, _node: &ProvisionedNode, _key_path: &Path, _port: u16) -> Result<(), String> {
        Ok(())
    }
}
