//! Wire-level tests for the node-facing protocol.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use sentinel_bundle::{
    BundleConfig, BundleService, ConfigValidator, FsObjectStore, ObjectStore, RuleValidator,
};
use sentinel_dispatch::JobQueue;
use sentinel_drift::{DriftConfig, DriftEngine};
use sentinel_identity::{IdentityService, TokenConfig, generate_signing_key};
use sentinel_nodes::{NodeRegistry, RegistryConfig};
use sentinel_proto::{ProtoState, router};
use sentinel_rollout::{HealthProber, RolloutConfig, RolloutEngine};
use sentinel_store::{MemoryStore, Store};
use sentinel_types::{
    BundleIn, HealthCheckEndpoint, Organization, Project, ProjectSettings, clock,
};

struct NullProber;

#[async_trait]
impl HealthProber for NullProber {
    async fn probe(&self, _endpoint: &HealthCheckEndpoint) -> bool {
        true
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    app: Router,
    store: Arc<dyn Store>,
    bundles: BundleService,
    org_id: Uuid,
    project_id: Uuid,
}

async fn fixture() -> Fixture {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
    let org_id = sentinel_types::new_id();
    let project_id = sentinel_types::new_id();
    store
        .insert_organization(Organization { id: org_id, name: "acme".into(), created_at: clock::now() })
        .await
        .expect("org");
    store
        .insert_project(Project {
            id: project_id,
            org_id,
            name: "edge".into(),
            slug: "edge".into(),
            settings: ProjectSettings::default(),
            created_at: clock::now(),
        })
        .await
        .expect("project");

    let dir = tempfile::tempdir().expect("tempdir");
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        dir.path().to_path_buf(),
        "https://artifacts.test",
        "presign-secret",
    ));
    let validator: Arc<dyn ConfigValidator> = Arc::new(RuleValidator::new(Arc::clone(&store)));
    let identity = IdentityService::new(Arc::clone(&store), TokenConfig::default());
    let bundles = BundleService::new(
        Arc::clone(&store),
        objects,
        validator,
        identity.clone(),
        JobQueue::detached(),
        BundleConfig::default(),
    );
    let rollouts = RolloutEngine::new(
        Arc::clone(&store),
        JobQueue::detached(),
        Arc::new(NullProber),
        RolloutConfig::default(),
    );
    let drift = Arc::new(DriftEngine::new(
        Arc::clone(&store),
        rollouts,
        JobQueue::detached(),
        DriftConfig::default(),
    ));
    let registry = Arc::new(NodeRegistry::new(
        Arc::clone(&store),
        drift,
        RegistryConfig::default(),
    ));
    let app = router(ProtoState {
        store: Arc::clone(&store),
        registry,
        bundles: bundles.clone(),
        identity,
    });
    Fixture { _dir: dir, app, store, bundles, org_id, project_id }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    auth: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = auth {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(value) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&value).expect("body")))
            .expect("request"),
        None => request.body(Body::empty()).expect("request"),
    };
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("bytes");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json")
    };
    (status, value)
}

async fn register_node(fx: &Fixture, name: &str) -> (Uuid, String) {
    let (status, body) = send(
        &fx.app,
        "POST",
        "/api/v1/projects/edge/nodes/register",
        None,
        Some(json!({ "name": name, "labels": { "region": "eu" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let node_id: Uuid = body["node_id"].as_str().expect("node_id").parse().expect("uuid");
    let node_key = body["node_key"].as_str().expect("node_key").to_string();
    (node_id, node_key)
}

#[tokio::test]
async fn register_issues_identity_once() {
    let fx = fixture().await;
    let (node_id, node_key) = register_node(&fx, "edge-1").await;
    assert!(!node_key.is_empty());
    let node = fx.store.get_node(node_id).await.expect("node");
    assert_ne!(node.node_key_hash, node_key);

    // Duplicate name conflicts.
    let (status, body) = send(
        &fx.app,
        "POST",
        "/api/v1/projects/edge/nodes/register",
        None,
        Some(json!({ "name": "edge-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");

    // Unknown tenant is a 404.
    let (status, _) = send(
        &fx.app,
        "POST",
        "/api/v1/projects/nope/nodes/register",
        None,
        Some(json!({ "name": "edge-2" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Empty names are rejected before touching the registry.
    let (status, body) = send(
        &fx.app,
        "POST",
        "/api/v1/projects/edge/nodes/register",
        None,
        Some(json!({ "name": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation");
}

#[tokio::test]
async fn heartbeat_requires_and_accepts_the_node_key() {
    let fx = fixture().await;
    let (node_id, node_key) = register_node(&fx, "edge-1").await;

    let uri = format!("/api/v1/nodes/{node_id}/heartbeat");
    let heartbeat = json!({ "health": { "status": "healthy" }, "metrics": { "error_rate": 0.0 } });

    let (status, body) = send(&fx.app, "POST", &uri, None, Some(heartbeat.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, body) = send(&fx.app, "POST", &uri, Some(&node_key), Some(heartbeat.clone())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    assert!(body["last_seen_at"].is_string());

    // A different node's key is authenticated but not authorized here.
    let (_, other_key) = register_node(&fx, "edge-2").await;
    let (status, body) = send(&fx.app, "POST", &uri, Some(&other_key), Some(heartbeat)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "not_authorized");
}

#[tokio::test]
async fn token_exchange_requires_a_signing_key_then_works() {
    let fx = fixture().await;
    let (node_id, node_key) = register_node(&fx, "edge-1").await;
    let uri = format!("/api/v1/nodes/{node_id}/token");

    let (status, body) = send(&fx.app, "POST", &uri, Some(&node_key), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "no_signing_key");

    fx.store
        .insert_signing_key(generate_signing_key(fx.org_id, None))
        .await
        .expect("key");
    let (status, body) = send(&fx.app, "POST", &uri, Some(&node_key), None).await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().expect("token").to_string();
    assert_eq!(token.split('.').count(), 3);

    // The token is an equivalent bearer credential.
    let hb_uri = format!("/api/v1/nodes/{node_id}/heartbeat");
    let (status, _) = send(&fx.app, "POST", &hb_uri, Some(&token), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn poll_returns_no_update_until_a_compiled_bundle_is_staged() {
    let fx = fixture().await;
    let (node_id, node_key) = register_node(&fx, "edge-1").await;
    let uri = format!("/api/v1/nodes/{node_id}/bundles/latest");

    let (status, body) = send(&fx.app, "GET", &uri, Some(&node_key), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["no_update"], true);
    assert_eq!(body["poll_after_s"], 30);

    // Compile a bundle and stage it on the node.
    let bundle = fx
        .bundles
        .create_bundle(BundleIn {
            project_id: fx.project_id,
            version: "1.0.0".into(),
            config_source: "listener \"web\" { port 8080 }".into(),
            source_type: Default::default(),
            source_ref: None,
        })
        .await
        .expect("create");
    fx.bundles.compile(bundle.id).await.expect("compile");
    fx.bundles.assign(bundle.id, &[node_id]).await.expect("assign");

    let (status, body) = send(&fx.app, "GET", &uri, Some(&node_key), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["bundle_id"], bundle.id.to_string());
    assert_eq!(body["version"], "1.0.0");
    assert!(body["checksum"].is_string());
    assert!(body["size_bytes"].is_u64());
    let url = body["download_url"].as_str().expect("download_url");
    assert!(url.contains("expires=") && url.contains("sig="));

    // Once the node reports the staged bundle active, polls quiet down.
    let hb_uri = format!("/api/v1/nodes/{node_id}/heartbeat");
    let (status, _) = send(
        &fx.app,
        "POST",
        &hb_uri,
        Some(&node_key),
        Some(json!({ "active_bundle_id": bundle.id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&fx.app, "GET", &uri, Some(&node_key), None).await;
    assert_eq!(body["no_update"], true);
}

#[tokio::test]
async fn poll_hides_revoked_bundles() {
    let fx = fixture().await;
    let (node_id, node_key) = register_node(&fx, "edge-1").await;

    let bundle = fx
        .bundles
        .create_bundle(BundleIn {
            project_id: fx.project_id,
            version: "1.0.0".into(),
            config_source: "listener \"web\" {}".into(),
            source_type: Default::default(),
            source_ref: None,
        })
        .await
        .expect("create");
    fx.bundles.compile(bundle.id).await.expect("compile");
    fx.bundles.assign(bundle.id, &[node_id]).await.expect("assign");
    fx.bundles.revoke(bundle.id).await.expect("revoke");

    let uri = format!("/api/v1/nodes/{node_id}/bundles/latest");
    let (status, body) = send(&fx.app, "GET", &uri, Some(&node_key), None).await;
    assert_eq!(status, StatusCode::OK);
    // Revocation cleared the staged pointer, so there is nothing to serve.
    assert_eq!(body["no_update"], true);
}

#[tokio::test]
async fn events_accept_single_and_batch_bodies() {
    let fx = fixture().await;
    let (node_id, node_key) = register_node(&fx, "edge-1").await;
    let uri = format!("/api/v1/nodes/{node_id}/events");

    let (status, body) = send(
        &fx.app,
        "POST",
        &uri,
        Some(&node_key),
        Some(json!({ "event_type": "config_applied", "message": "activated 1.0.0" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["stored"], 1);

    let (status, body) = send(
        &fx.app,
        "POST",
        &uri,
        Some(&node_key),
        Some(json!({
            "events": [
                { "event_type": "reload", "message": "listener reloaded" },
                { "event_type": "upstream_down", "severity": "error", "message": "backend gone" }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["stored"], 2);

    let events = fx.store.list_node_events(node_id, 10).await.expect("events");
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn runtime_config_upsert_returns_the_digest() {
    let fx = fixture().await;
    let (node_id, node_key) = register_node(&fx, "edge-1").await;
    let uri = format!("/api/v1/nodes/{node_id}/config");

    let (status, body) = send(
        &fx.app,
        "POST",
        &uri,
        Some(&node_key),
        Some(json!({ "config_kdl": "listener \"web\" { port 8080 }" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let hash = body["config_hash"].as_str().expect("hash");
    assert_eq!(hash.len(), 64);
    assert_eq!(
        fx.store
            .get_node(node_id)
            .await
            .expect("node")
            .runtime_config_hash
            .as_deref(),
        Some(hash)
    );
}
