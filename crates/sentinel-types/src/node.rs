//! Nodes: registered edge proxy processes, their heartbeats, groups, and
//! reported events.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bundle::Labels;

/// Recognized key inside a heartbeat's free-form `health` map.
pub const HEALTH_STATUS_KEY: &str = "status";

/// Liveness as tracked by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// A running proxy instance.
///
/// `active_bundle_id` is what the node reports it is running;
/// `staged_bundle_id` is the next assignment; `expected_bundle_id` is what the
/// control plane believes should be active, written only by the rollout
/// engine on step completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Unique per project.
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub status: NodeStatus,
    pub last_seen_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// SHA-256 hex of the secret issued once at registration.
    pub node_key_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_bundle_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_bundle_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_bundle_id: Option<Uuid>,
    /// If set, the node refuses assignments to any other bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_bundle_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_bundle_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bundle_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<Uuid>,
    /// SHA-256 hex of the last runtime KDL the node uploaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_config_hash: Option<String>,
}

impl Node {
    /// Whether `labels` is a superset of `wanted` (key-by-key equality).
    pub fn matches_labels(&self, wanted: &Labels) -> bool {
        wanted
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }

    /// Whether the node accepts an assignment to `bundle_id` given its pin.
    pub fn accepts_bundle(&self, bundle_id: Uuid) -> bool {
        self.pinned_bundle_id.is_none_or(|pinned| pinned == bundle_id)
    }
}

/// Append-only heartbeat row. Retained to a configurable cap per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub id: Uuid,
    pub node_id: Uuid,
    /// Free-form; recognized key [`HEALTH_STATUS_KEY`] with values
    /// `healthy | degraded | unhealthy`.
    #[serde(default)]
    pub health: BTreeMap<String, serde_json::Value>,
    /// Recognized keys: `error_rate`, `latency_p99_ms`, `cpu_percent`,
    /// `memory_percent`.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_bundle_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_bundle_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

impl NodeHeartbeat {
    /// The recognized health status string, when present and well-formed.
    pub fn health_status(&self) -> Option<&str> {
        self.health.get(HEALTH_STATUS_KEY).and_then(|v| v.as_str())
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

/// Named set of node ids within a project; target selectors may reference
/// groups by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub node_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// An event reported by a node through the node-facing protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub id: Uuid,
    pub node_id: Uuid,
    pub event_type: String,
    #[serde(default)]
    pub severity: EventSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub inserted_at: DateTime<Utc>,
}
