//! Rollouts: batched, health-gated plans that move a set of nodes onto a
//! target bundle, plus the per-step and per-node progression records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bundle::Labels;

/// Which nodes a rollout targets. A closed tagged union; resolution order is
/// deterministic (registration order for `All`/`Labels`, given order for
/// explicit ids, group order then member order for groups).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Every node in the project.
    All,
    /// Nodes whose labels are a superset of this map.
    Labels { labels: Labels },
    /// Explicit list; ids outside the project are silently dropped.
    NodeIds { node_ids: Vec<Uuid> },
    /// Union of the referenced groups' members.
    GroupIds { group_ids: Vec<Uuid> },
}

/// Health predicates evaluated over the latest heartbeat of each available
/// node before a step may complete. Unknown keys are rejected at the edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthGates {
    /// Latest heartbeat must report `health.status == "healthy"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_healthy: Option<bool>,
    /// `metrics.error_rate` must be ≤ this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_error_rate: Option<f64>,
    /// `metrics.latency_p99_ms` must be ≤ this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<f64>,
    /// `metrics.cpu_percent` must be ≤ this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f64>,
    /// `metrics.memory_percent` must be ≤ this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_percent: Option<f64>,
}

impl HealthGates {
    /// Whether any predicate is configured at all.
    pub fn is_empty(&self) -> bool {
        self.heartbeat_healthy.is_none()
            && self.max_error_rate.is_none()
            && self.max_latency_ms.is_none()
            && self.max_cpu_percent.is_none()
            && self.max_memory_percent.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Batched progression, one step at a time.
    #[default]
    Rolling,
    /// A single step containing every target node.
    AllAtOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RolloutState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RolloutState::Completed | RolloutState::Failed | RolloutState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    NotRequired,
    PendingApproval,
    Approved,
    Rejected,
}

impl ApprovalState {
    /// Whether planning may proceed under this approval state.
    pub fn allows_planning(self) -> bool {
        matches!(self, ApprovalState::NotRequired | ApprovalState::Approved)
    }
}

/// Structured failure recorded on a rollout or step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutError {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<i64>,
}

impl RolloutError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), step_index: None, elapsed_seconds: None }
    }

    pub fn step_deadline(step_index: u32, elapsed_seconds: i64) -> Self {
        Self {
            reason: "step_deadline_exceeded".into(),
            step_index: Some(step_index),
            elapsed_seconds: Some(elapsed_seconds),
        }
    }

    pub fn deadline(elapsed_seconds: i64) -> Self {
        Self {
            reason: "deadline_exceeded".into(),
            step_index: None,
            elapsed_seconds: Some(elapsed_seconds),
        }
    }
}

/// The orchestration unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Must be `compiled` at plan time; re-checked at every step start.
    pub bundle_id: Uuid,
    pub target_selector: TargetSelector,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// 1–100; overrides `batch_size` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_percentage: Option<u32>,
    #[serde(default)]
    pub max_unavailable: u32,
    #[serde(default = "default_progress_deadline")]
    pub progress_deadline_seconds: u64,
    #[serde(default)]
    pub health_gates: HealthGates,
    /// Endpoint ids probed as a conjunction during verification.
    #[serde(default)]
    pub custom_health_checks: Vec<Uuid>,
    #[serde(default)]
    pub auto_rollback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: RolloutState,
    #[serde(default)]
    pub approval_state: ApprovalState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RolloutError>,
    pub created_by_id: Uuid,
    pub created_at: DateTime<Utc>,
}

fn default_batch_size() -> u32 {
    1
}

fn default_progress_deadline() -> u64 {
    600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Verifying,
    Completed,
    Failed,
}

impl StepState {
    /// A step currently holding the rollout's single-active-step slot.
    pub fn is_active(self) -> bool {
        matches!(self, StepState::Running | StepState::Verifying)
    }
}

/// One batch of a rollout. Created at plan time; `node_ids` never changes
/// afterwards, and the steps of a rollout partition its resolved target set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStep {
    pub id: Uuid,
    pub rollout_id: Uuid,
    /// 0-based, dense, ordered.
    pub step_index: u32,
    pub node_ids: Vec<Uuid>,
    #[serde(default)]
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RolloutError>,
}

/// Per-node progression within a rollout. Transitions are monotonic:
/// `pending → staging → activating → active`, or `→ failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeProgress {
    #[default]
    Pending,
    Staging,
    Activating,
    Active,
    Failed,
}

impl NodeProgress {
    fn rank(self) -> u8 {
        match self {
            NodeProgress::Pending => 0,
            NodeProgress::Staging => 1,
            NodeProgress::Activating => 2,
            NodeProgress::Active => 3,
            NodeProgress::Failed => 4,
        }
    }

    /// Forward-only: a status never moves back toward `pending`.
    pub fn can_advance_to(self, next: NodeProgress) -> bool {
        next == NodeProgress::Failed || next.rank() > self.rank()
    }
}

/// Per-(node, rollout) progression row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBundleStatus {
    pub id: Uuid,
    pub rollout_id: Uuid,
    pub node_id: Uuid,
    #[serde(default)]
    pub state: NodeProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report_at: Option<DateTime<Utc>>,
}

/// One user's approval of a rollout. `(rollout_id, user_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutApproval {
    pub id: Uuid,
    pub rollout_id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An HTTP endpoint probed during step verification; passes when the probe
/// returns the expected status within the timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckEndpoint {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub url: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
}

fn default_expect_status() -> u16 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_round_trips_tagged() {
        let sel = TargetSelector::Labels {
            labels: Labels::from([("region".into(), "eu".into())]),
        };
        let json = serde_json::to_string(&sel).expect("serialize");
        assert!(json.contains("\"type\":\"labels\""));
        let back: TargetSelector = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, sel);

        let all: TargetSelector = serde_json::from_str(r#"{"type":"all"}"#).expect("all");
        assert_eq!(all, TargetSelector::All);
    }

    #[test]
    fn health_gates_reject_unknown_keys() {
        let err = serde_json::from_str::<HealthGates>(r#"{"max_disk_percent": 90}"#);
        assert!(err.is_err());
        let ok: HealthGates =
            serde_json::from_str(r#"{"heartbeat_healthy":true,"max_error_rate":0.05}"#)
                .expect("recognized keys");
        assert_eq!(ok.heartbeat_healthy, Some(true));
        assert_eq!(ok.max_error_rate, Some(0.05));
        assert!(!ok.is_empty());
        assert!(HealthGates::default().is_empty());
    }

    #[test]
    fn rollout_state_terminality() {
        assert!(RolloutState::Completed.is_terminal());
        assert!(RolloutState::Failed.is_terminal());
        assert!(RolloutState::Cancelled.is_terminal());
        assert!(!RolloutState::Running.is_terminal());
        assert!(!RolloutState::Paused.is_terminal());
        assert!(!RolloutState::Pending.is_terminal());
    }

    #[test]
    fn approval_state_gates_planning() {
        assert!(ApprovalState::NotRequired.allows_planning());
        assert!(ApprovalState::Approved.allows_planning());
        assert!(!ApprovalState::PendingApproval.allows_planning());
        assert!(!ApprovalState::Rejected.allows_planning());
    }

    #[test]
    fn node_progress_is_monotonic() {
        assert!(NodeProgress::Pending.can_advance_to(NodeProgress::Staging));
        assert!(NodeProgress::Staging.can_advance_to(NodeProgress::Activating));
        assert!(NodeProgress::Activating.can_advance_to(NodeProgress::Active));
        assert!(!NodeProgress::Active.can_advance_to(NodeProgress::Staging));
        assert!(!NodeProgress::Activating.can_advance_to(NodeProgress::Pending));
        // Failure is reachable from anywhere.
        assert!(NodeProgress::Active.can_advance_to(NodeProgress::Failed));
    }

    #[test]
    fn step_active_states() {
        assert!(StepState::Running.is_active());
        assert!(StepState::Verifying.is_active());
        assert!(!StepState::Pending.is_active());
        assert!(!StepState::Completed.is_active());
        assert!(!StepState::Failed.is_active());
    }

    #[test]
    fn step_deadline_error_shape() {
        let err = RolloutError::step_deadline(2, 31);
        assert_eq!(err.reason, "step_deadline_exceeded");
        assert_eq!(err.step_index, Some(2));
        assert_eq!(err.elapsed_seconds, Some(31));
        let json = serde_json::to_string(&err).expect("serialize");
        assert!(json.contains("\"step_index\":2"));
    }
}
