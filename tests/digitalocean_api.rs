//! Integration tests for the DigitalOcean client
//!
//! A thin axum server emulates the parts of the v2 API the client uses.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use clusterforge::provider::{
    DigitalOceanClient, NodeHandle, ProviderClient, ProviderError,
};
use clusterforge::provision::{ProvisionOptions, ProvisionOrchestrator};
use clusterforge::topology::{NodeRole, RoleCounts};

const TOKEN: &str = "test-token";

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    droplets: HashMap<u64, Value>,
    polls: HashMap<u64, u32>,
    keys: Vec<Value>,
    key_creates: u32,
    deleted_tags: Vec<String>,
    deleted_keys: Vec<String>,
}

#[derive(Clone, Default)]
struct FakeApi {
    inner: Arc<Mutex<Inner>>,
    /// GET calls answered without networks before addresses appear
    polls_until_address: u32,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", TOKEN))
        .unwrap_or(false)
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"id": "unauthorized", "message": "Unable to authenticate you"})),
    )
}

async fn create_droplet(
    State(api): State<FakeApi>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut inner = api.inner.lock().unwrap();
    inner.next_id += 1;
    let id = inner.next_id;
    inner.droplets.insert(id, body.clone());
    (
        StatusCode::ACCEPTED,
        Json(json!({"droplet": {"id": id, "name": body["name"], "networks": {"v4": []}}})),
    )
}

async fn get_droplet(
    State(api): State<FakeApi>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut inner = api.inner.lock().unwrap();
    let Some(body) = inner.droplets.get(&id).cloned() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"id": "not_found", "message": "The resource you were accessing could not be found."})),
        );
    };

    let polls = inner.polls.entry(id).or_insert(0);
    *polls += 1;
    let networks = if *polls > api.polls_until_address {
        json!({"v4": [
            {"ip_address": format!("10.132.0.{}", id), "type": "private"},
            {"ip_address": format!("159.203.0.{}", id), "type": "public"}
        ]})
    } else {
        json!({"v4": []})
    };

    (
        StatusCode::OK,
        Json(json!({"droplet": {"id": id, "name": body["name"], "networks": networks}})),
    )
}

async fn delete_by_tag(
    State(api): State<FakeApi>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let Some(tag) = params.get("tag_name") else {
        return StatusCode::BAD_REQUEST;
    };
    let mut inner = api.inner.lock().unwrap();
    inner.droplets.retain(|_, d| {
        !d["tags"]
            .as_array()
            .map(|tags| tags.iter().any(|t| t == tag.as_str()))
            .unwrap_or(false)
    });
    inner.deleted_tags.push(tag.clone());
    StatusCode::NO_CONTENT
}

async fn list_keys(State(api): State<FakeApi>) -> Json<Value> {
    let inner = api.inner.lock().unwrap();
    Json(json!({"ssh_keys": inner.keys}))
}

async fn create_key(State(api): State<FakeApi>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut inner = api.inner.lock().unwrap();
    inner.key_creates += 1;
    let key = json!({
        "id": 500 + inner.key_creates,
        "name": body["name"],
        "fingerprint": format!("fp:{}", inner.key_creates),
        "public_key": body["public_key"],
    });
    inner.keys.push(key.clone());
    (StatusCode::CREATED, Json(json!({"ssh_key": key})))
}

async fn delete_key(State(api): State<FakeApi>, Path(fingerprint): Path<String>) -> StatusCode {
    let mut inner = api.inner.lock().unwrap();
    inner.keys.retain(|k| k["fingerprint"] != fingerprint.as_str());
    inner.deleted_keys.push(fingerprint);
    StatusCode::NO_CONTENT
}

/// Start the fake API, returning its base URL and state
async fn start_fake(api: FakeApi) -> String {
    let port = find_available_port();
    let app = Router::new()
        .route("/v2/droplets", post(create_droplet).delete(delete_by_tag))
        .route("/v2/droplets/{id}", get(get_droplet))
        .route("/v2/account/keys", get(list_keys).post(create_key))
        .route("/v2/account/keys/{fingerprint}", delete(delete_key))
        .with_state(api);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind fake API");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    sleep(Duration::from_millis(100)).await;
    format!("http://127.0.0.1:{}", port)
}

#[tokio::test]
async fn test_provision_against_fake_api() {
    let api = FakeApi {
        polls_until_address: 2,
        ..FakeApi::default()
    };
    let base = start_fake(api.clone()).await;
    let client = DigitalOceanClient::new(base, TOKEN);
    let orchestrator = ProvisionOrchestrator::new(Arc::new(client));

    let opts = ProvisionOptions {
        worker_size: Some("4gb".to_string()),
        public_key: "ssh-rsa AAAA test".to_string(),
        poll_interval: Duration::from_millis(10),
        address_timeout: Duration::from_secs(5),
        ..ProvisionOptions::default()
    };
    let counts = RoleCounts::new()
        .with(NodeRole::ETCD, 1)
        .with(NodeRole::MASTER, 1)
        .with(NodeRole::WORKER, 2);

    let cluster = orchestrator
        .provision(&CancellationToken::new(), &opts, &counts)
        .await
        .unwrap();

    assert_eq!(cluster.len(), 4);
    assert_eq!(cluster.etcd[0].hostname, "etcd001");
    assert!(cluster.master[0]
        .public_address
        .to_string()
        .starts_with("159.203.0."));
    assert!(cluster.worker[0].private_address.is_some());

    let inner = api.inner.lock().unwrap();
    assert_eq!(inner.key_creates, 1);
    for droplet in inner.droplets.values() {
        assert_eq!(droplet["ssh_keys"][0], "fp:1");
        assert_eq!(droplet["private_networking"], true);
        assert_eq!(droplet["tags"][0], "clusterforge");
        let expected_size = if droplet["name"].as_str().unwrap().starts_with("worker") {
            "4gb"
        } else {
            "1gb"
        };
        assert_eq!(droplet["size"], expected_size);
    }
}

#[tokio::test]
async fn test_existing_key_is_reused() {
    let api = FakeApi::default();
    api.inner.lock().unwrap().keys.push(json!({
        "id": 7, "name": "clusterforge-key", "fingerprint": "aa:bb:cc"
    }));
    let base = start_fake(api.clone()).await;
    let client = DigitalOceanClient::new(base, TOKEN);

    let key = client.ensure_key("clusterforge-key", "ssh-rsa AAAA").await.unwrap();
    assert_eq!(key.id, "7");
    assert_eq!(key.fingerprint, "aa:bb:cc");
    assert_eq!(api.inner.lock().unwrap().key_creates, 0);
}

#[tokio::test]
async fn test_bad_token_is_api_error() {
    let base = start_fake(FakeApi::default()).await;
    let client = DigitalOceanClient::new(base, "wrong");

    let err = client
        .get_node(&NodeHandle {
            id: "1".to_string(),
            name: "etcd001".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 401, .. }));
}

#[tokio::test]
async fn test_unknown_droplet_is_not_found() {
    let base = start_fake(FakeApi::default()).await;
    let client = DigitalOceanClient::new(base, TOKEN);

    let err = client
        .get_node(&NodeHandle {
            id: "999".to_string(),
            name: "ghost001".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, ProviderError::NodeNotFound("ghost001".to_string()));
}

#[tokio::test]
async fn test_delete_by_tag_and_key() {
    let api = FakeApi::default();
    let base = start_fake(api.clone()).await;
    let client = DigitalOceanClient::new(base, TOKEN);

    client.ensure_key("clusterforge-key", "ssh-rsa AAAA").await.unwrap();
    client.delete_nodes_by_tag("blue").await.unwrap();
    assert!(client.delete_key("clusterforge-key").await.unwrap());
    assert!(!client.delete_key("clusterforge-key").await.unwrap());

    let inner = api.inner.lock().unwrap();
    assert_eq!(inner.deleted_tags, vec!["blue"]);
    assert_eq!(inner.deleted_keys, vec!["fp:1"]);
    assert!(inner.keys.is_empty());
}
