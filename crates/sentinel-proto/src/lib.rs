//! Node-facing protocol.
//!
//! The HTTP+JSON surface nodes talk to, under `/api/v1`:
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | POST | `/projects/{slug}/nodes/register` | Issue `{node_id, node_key}` once |
//! | POST | `/nodes/{id}/heartbeat` | Liveness + observed state |
//! | GET | `/nodes/{id}/bundles/latest` | Next assignment or `no_update` |
//! | POST | `/nodes/{id}/token` | Exchange key for a bearer token |
//! | POST | `/nodes/{id}/events` | Single event or `{events: [...]}` batch |
//! | POST | `/nodes/{id}/config` | Upsert runtime KDL (stored as digest) |
//!
//! Authentication accepts the raw registration key or a previously issued
//! token as equivalent bearer credentials. All writes for one node are
//! serialized by the store; cancellation is cooperative at the request
//! boundary.

mod error;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use sentinel_bundle::BundleService;
use sentinel_identity::IdentityService;
use sentinel_nodes::{EventIn, HeartbeatIn, NodeRegistry, RegistrationIn};
use sentinel_store::Store;
use sentinel_types::Node;

pub use error::ApiError;

/// Everything the protocol handlers need.
#[derive(Clone)]
pub struct ProtoState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<NodeRegistry>,
    pub bundles: BundleService,
    pub identity: IdentityService,
}

/// Build the `/api/v1` router.
pub fn router(state: ProtoState) -> Router {
    Router::new()
        .route("/api/v1/projects/:slug/nodes/register", post(register))
        .route("/api/v1/nodes/:id/heartbeat", post(heartbeat))
        .route("/api/v1/nodes/:id/bundles/latest", get(poll_next_bundle))
        .route("/api/v1/nodes/:id/token", post(exchange_token))
        .route("/api/v1/nodes/:id/events", post(report_events))
        .route("/api/v1/nodes/:id/config", post(put_runtime_config))
        .with_state(state)
}

fn bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::MissingAuth)
}

async fn authenticate(
    state: &ProtoState,
    headers: &HeaderMap,
    node_id: Uuid,
) -> Result<Node, ApiError> {
    let credential = bearer(headers)?;
    Ok(state.identity.authenticate_node(node_id, credential).await?)
}

#[instrument(skip_all, fields(%slug))]
async fn register(
    State(state): State<ProtoState>,
    Path(slug): Path<String>,
    Json(input): Json<RegistrationIn>,
) -> Result<impl IntoResponse, ApiError> {
    if input.name.trim().is_empty() {
        return Err(ApiError::Validation("node name must not be empty".into()));
    }
    let project = state.store.get_project_by_slug(&slug).await?;
    let registered = state.registry.register(project.id, input).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "node_id": registered.node.id,
            "node_key": registered.node_key,
            "poll_interval_s": registered.poll_interval.as_secs(),
        })),
    ))
}

#[instrument(skip_all, fields(%id))]
async fn heartbeat(
    State(state): State<ProtoState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(input): Json<HeartbeatIn>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers, id).await?;
    let node = state.registry.heartbeat(id, input).await?;
    Ok(Json(json!({ "ok": true, "last_seen_at": node.last_seen_at })))
}

#[instrument(skip_all, fields(%id))]
async fn poll_next_bundle(
    State(state): State<ProtoState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let node = authenticate(&state, &headers, id).await?;
    let poll_after_s = state.registry.config().poll_interval.as_secs();

    let no_update = Json(json!({ "no_update": true, "poll_after_s": poll_after_s }));
    let Some(staged) = node.staged_bundle_id else {
        return Ok(no_update);
    };
    if node.active_bundle_id == Some(staged) {
        return Ok(no_update);
    }
    let bundle = state.store.get_bundle(staged).await?;
    if !bundle.status.is_distributable() {
        return Ok(no_update);
    }
    let download_url = state.bundles.download_url(&bundle).await?;
    Ok(Json(json!({
        "bundle_id": bundle.id,
        "version": bundle.version,
        "checksum": bundle.checksum,
        "size_bytes": bundle.size_bytes,
        "download_url": download_url,
        "poll_after_s": poll_after_s,
    })))
}

#[instrument(skip_all, fields(%id))]
async fn exchange_token(
    State(state): State<ProtoState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let node = authenticate(&state, &headers, id).await?;
    let (token, expires_at) = state.identity.issue_node_token(&node).await?;
    Ok(Json(json!({ "token": token, "expires_at": expires_at })))
}

/// Either a single event object or a `{events: [...]}` batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventsBody {
    Batch { events: Vec<EventIn> },
    Single(EventIn),
}

#[instrument(skip_all, fields(%id))]
async fn report_events(
    State(state): State<ProtoState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<EventsBody>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers, id).await?;
    let events = match body {
        EventsBody::Batch { events } => events,
        EventsBody::Single(event) => vec![event],
    };
    let stored = state.registry.report_events(id, events).await?;
    Ok((StatusCode::CREATED, Json(json!({ "stored": stored }))))
}

#[derive(Debug, Deserialize)]
struct RuntimeConfigBody {
    config_kdl: String,
}

#[instrument(skip_all, fields(%id))]
async fn put_runtime_config(
    State(state): State<ProtoState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<RuntimeConfigBody>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers, id).await?;
    let hash = state.registry.put_runtime_config(id, &body.config_kdl).await?;
    Ok(Json(json!({ "config_hash": hash })))
}
