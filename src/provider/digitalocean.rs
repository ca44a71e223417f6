//! DigitalOcean v2 API client

use std::net::IpAddr;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{KeyHandle, NodeHandle, NodeRequest, NodeStatus, ProviderClient, ProviderError};

pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com";

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DropletCreateRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub ssh_keys: Vec<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    pub private_networking: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Clone, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    #[serde(default)]
    networks: Networks,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Clone, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct KeyList {
    #[serde(default)]
    ssh_keys: Vec<SshKey>,
}

#[derive(Debug, Clone, Deserialize)]
struct KeyEnvelope {
    ssh_key: SshKey,
}

#[derive(Debug, Clone, Deserialize)]
struct SshKey {
    id: u64,
    name: String,
    fingerprint: String,
}

impl From<SshKey> for KeyHandle {
    fn from(key: SshKey) -> Self {
        KeyHandle {
            id: key.id.to_string(),
            name: key.name,
            fingerprint: key.fingerprint,
        }
    }
}

impl DropletCreateRequest {
    pub fn from_request(request: &NodeRequest) -> Self {
        Self {
            name: request.spec.name.clone(),
            region: request.region.clone(),
            size: request.size.clone(),
            image: request.image.clone(),
            ssh_keys: vec![request.key.fingerprint.clone()],
            tags: request.tags.clone(),
            user_data: request.user_data.clone(),
            private_networking: true,
        }
    }
}

fn droplet_status(droplet: &Droplet) -> Result<NodeStatus, ProviderError> {
    let mut status = NodeStatus::default();
    for net in &droplet.networks.v4 {
        let addr: IpAddr = net.ip_address.parse().map_err(|_| {
            ProviderError::InvalidResponse(format!(
                "droplet {} has malformed address '{}'",
                droplet.name, net.ip_address
            ))
        })?;
        match net.kind.as_str() {
            "public" => status.public_address = Some(addr),
            "private" => status.private_address = Some(addr),
            _ => {}
        }
    }
    Ok(status)
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct DigitalOceanClient {
    client: Client,
    base_url: String,
    token: String,
}

impl DigitalOceanClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        self.client.request(method, url).bearer_auth(&self.token)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ProviderError> {
        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn find_key(&self, name: &str) -> Result<Option<SshKey>, ProviderError> {
        let req = self.build_request(Method::GET, "/v2/account/keys?per_page=200");
        let list: KeyList = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(list.ssh_keys.into_iter().find(|k| k.name == name))
    }
}

#[async_trait]
impl ProviderClient for DigitalOceanClient {
    fn name(&self) -> &str {
        "digitalocean"
    }

    async fn create_node(&self, request: &NodeRequest) -> Result<NodeHandle, ProviderError> {
        let body = DropletCreateRequest::from_request(request);
        let req = self.build_request(Method::POST, "/v2/droplets").json(&body);

        let created: DropletEnvelope = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        debug!("Droplet {} accepted as id {}", created.droplet.name, created.droplet.id);
        Ok(NodeHandle {
            id: created.droplet.id.to_string(),
            name: created.droplet.name,
        })
    }

    async fn get_node(&self, handle: &NodeHandle) -> Result<NodeStatus, ProviderError> {
        let req = self.build_request(Method::GET, &format!("/v2/droplets/{}", handle.id));
        let response = match self.send(req).await {
            Err(ProviderError::Api { status: 404, .. }) => {
                return Err(ProviderError::NodeNotFound(handle.name.clone()))
            }
            other => other?,
        };
        let envelope: DropletEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        droplet_status(&envelope.droplet)
    }

    async fn ensure_key(&self, name: &str, public_key: &str) -> Result<KeyHandle, ProviderError> {
        if let Some(existing) = self.find_key(name).await? {
            info!("Using existing key '{}' ({})", name, existing.fingerprint);
            return Ok(existing.into());
        }

        info!("Registering new key '{}'", name);
        let req = self
            .build_request(Method::POST, "/v2/account/keys")
            .json(&serde_json::json!({ "name": name, "public_key": public_key }));
        let created: KeyEnvelope = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(created.ssh_key.into())
    }

    async fn delete_nodes_by_tag(&self, tag: &str) -> Result<(), ProviderError> {
        info!("Deleting droplets tagged '{}'", tag);
        let req = self
            .build_request(Method::DELETE, "/v2/droplets")
            .query(&[("tag_name", tag)]);
        self.send(req).await?;
        Ok(())
    }

    async fn delete_key(&self, name: &str) -> Result<bool, ProviderError> {
        let Some(key) = self.find_key(name).await? else {
            debug!("Key '{}' not registered, nothing to delete", name);
            return Ok(false);
        };

        info!("Deleting key '{}'", name);
        let req = self.build_request(
            Method::DELETE,
            &format!("/v2/account/keys/{}", key.fingerprint),
        );
        self.send(req).await?;
        Ok(true)
    }
}
