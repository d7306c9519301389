//! Drift: a node running something other than what the control plane expects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a drift event was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftResolution {
    /// An operator acknowledged or corrected the node by hand.
    Manual,
    /// A remediation rollout was started for this drift.
    RolloutStarted,
    /// The node converged when a rollout step completed.
    RolloutCompleted,
    /// The expectation was cleared, so there is nothing to drift from.
    AutoCleared,
}

/// Opened when an online node's `active_bundle_id` differs from a non-null
/// `expected_bundle_id`. At most one unresolved event exists per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEvent {
    pub id: Uuid,
    pub node_id: Uuid,
    pub project_id: Uuid,
    pub expected_bundle_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_bundle_id: Option<Uuid>,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<DriftResolution>,
}

impl DriftEvent {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}
