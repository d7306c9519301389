//! Node registry.
//!
//! Registration issues a node its identity exactly once; heartbeats keep the
//! node row fresh, append to the heartbeat time series, and reconcile drift
//! synchronously for that node. A periodic liveness sweep marks silent nodes
//! offline in a single bulk pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use sentinel_drift::DriftEngine;
use sentinel_identity::generate_secret;
use sentinel_store::{HeartbeatUpdate, Store};
use sentinel_types::{
    EngineError, EventSeverity, Node, NodeEvent, NodeGroup, NodeHeartbeat, NodeStatus, clock,
};

/// Registry knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Poll/heartbeat interval handed to nodes.
    pub poll_interval: Duration,
    /// Nodes silent for longer than this are swept offline.
    pub stale_threshold: Duration,
    /// Heartbeat rows retained per node by the cleanup job.
    pub heartbeat_cap: usize,
    /// Event rows retained per node by the cleanup job.
    pub node_event_cap: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
            heartbeat_cap: 100,
            node_event_cap: 500,
        }
    }
}

/// Registration request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationIn {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub version: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
}

/// Registration result; `node_key` is shown exactly once and never stored.
#[derive(Debug, Clone)]
pub struct Registered {
    pub node: Node,
    pub node_key: String,
    pub poll_interval: Duration,
}

/// Heartbeat request body. Recognized keys only; everything else is dropped
/// at the protocol edge.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatIn {
    #[serde(default)]
    pub health: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub active_bundle_id: Option<Uuid>,
    pub staged_bundle_id: Option<Uuid>,
    pub version: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
}

/// One reported node event.
#[derive(Debug, Clone, Deserialize)]
pub struct EventIn {
    pub event_type: String,
    #[serde(default)]
    pub severity: EventSeverity,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Store-backed node lifecycle operations.
pub struct NodeRegistry {
    store: Arc<dyn Store>,
    drift: Arc<DriftEngine>,
    config: RegistryConfig,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn Store>, drift: Arc<DriftEngine>, config: RegistryConfig) -> Self {
        Self { store, drift, config }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a node. The returned key is the node's only credential until
    /// it exchanges it for a token; it cannot be recovered later.
    pub async fn register(
        &self,
        project_id: Uuid,
        input: RegistrationIn,
    ) -> Result<Registered, EngineError> {
        let project = self.store.get_project(project_id).await?;
        let issued = generate_secret();
        let now = clock::now();
        let node = Node {
            id: sentinel_types::new_id(),
            project_id: project.id,
            name: input.name,
            labels: input.labels,
            capabilities: input.capabilities,
            version: input.version,
            status: NodeStatus::Online,
            last_seen_at: now,
            registered_at: now,
            ip: input.ip,
            hostname: input.hostname,
            node_key_hash: issued.hash,
            active_bundle_id: None,
            staged_bundle_id: None,
            expected_bundle_id: None,
            pinned_bundle_id: None,
            min_bundle_version: None,
            max_bundle_version: None,
            environment_id: None,
            runtime_config_hash: None,
        };
        self.store.insert_node(node.clone()).await?;
        info!(node = %node.id, project = %project.id, name = %node.name, "node registered");
        Ok(Registered {
            node,
            node_key: issued.secret,
            poll_interval: self.config.poll_interval,
        })
    }

    /// Ingest a heartbeat: refresh the node row, append the time-series row,
    /// and reconcile drift for this node synchronously.
    pub async fn heartbeat(&self, node_id: Uuid, input: HeartbeatIn) -> Result<Node, EngineError> {
        let now = clock::now();
        let heartbeat = NodeHeartbeat {
            id: sentinel_types::new_id(),
            node_id,
            health: input.health,
            metrics: input.metrics,
            active_bundle_id: input.active_bundle_id,
            staged_bundle_id: input.staged_bundle_id,
            version: input.version.clone(),
            inserted_at: now,
        };
        let update = HeartbeatUpdate {
            version: input.version,
            ip: input.ip,
            hostname: input.hostname,
            active_bundle_id: input.active_bundle_id,
            staged_bundle_id: input.staged_bundle_id,
        };
        let node = self.store.apply_heartbeat(node_id, now, update, heartbeat).await?;
        self.drift.reconcile_node(&node).await?;
        Ok(node)
    }

    /// Sweep every online node not seen within the stale threshold. Bulk,
    /// single-pass, idempotent.
    pub async fn liveness_sweep(&self) -> Result<Vec<Uuid>, EngineError> {
        let cutoff = clock::now()
            - chrono::Duration::seconds(self.config.stale_threshold.as_secs() as i64);
        let swept = self.store.sweep_stale_nodes(cutoff).await?;
        if !swept.is_empty() {
            info!(count = swept.len(), "liveness sweep marked nodes offline");
        }
        Ok(swept)
    }

    /// Store a batch of node-reported events.
    pub async fn report_events(
        &self,
        node_id: Uuid,
        events: Vec<EventIn>,
    ) -> Result<usize, EngineError> {
        let node = self.store.get_node(node_id).await?;
        let now = clock::now();
        let rows: Vec<NodeEvent> = events
            .into_iter()
            .map(|event| NodeEvent {
                id: sentinel_types::new_id(),
                node_id: node.id,
                event_type: event.event_type,
                severity: event.severity,
                message: event.message,
                metadata: event.metadata,
                inserted_at: now,
            })
            .collect();
        let count = rows.len();
        self.store.insert_node_events(rows).await?;
        Ok(count)
    }

    /// Record the digest of the runtime KDL a node is carrying. Only the
    /// hash is kept; the config text stays on the node.
    pub async fn put_runtime_config(
        &self,
        node_id: Uuid,
        config_kdl: &str,
    ) -> Result<String, EngineError> {
        let mut node = self.store.get_node(node_id).await?;
        let hash = hex::encode(Sha256::digest(config_kdl.as_bytes()));
        node.runtime_config_hash = Some(hash.clone());
        self.store.put_node(node).await?;
        debug!(node = %node_id, "runtime config digest updated");
        Ok(hash)
    }

    /// Create a named group from project node ids; foreign ids are dropped.
    pub async fn create_group(
        &self,
        project_id: Uuid,
        name: impl Into<String>,
        node_ids: &[Uuid],
    ) -> Result<NodeGroup, EngineError> {
        let members = self.store.nodes_by_ids(project_id, node_ids).await?;
        let group = NodeGroup {
            id: sentinel_types::new_id(),
            project_id,
            name: name.into(),
            node_ids: members.iter().map(|n| n.id).collect(),
        };
        self.store.insert_group(group.clone()).await?;
        Ok(group)
    }

    /// Row-cap enforcement, driven by the cleanup cron jobs.
    pub async fn cleanup_heartbeats(&self) -> Result<u64, EngineError> {
        self.store.trim_heartbeats(self.config.heartbeat_cap).await
    }

    pub async fn cleanup_events(&self) -> Result<u64, EngineError> {
        self.store.trim_node_events(self.config.node_event_cap).await
    }
}
