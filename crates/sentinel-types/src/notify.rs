//! Outbound notification payloads fanned out to webhook endpoints and the
//! live-update broadcaster.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::drift::DriftResolution;
use crate::rollout::RolloutState;

/// Everything the control plane announces to the outside world.
///
/// Delivery is best-effort with bounded retries; consumers must tolerate
/// duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    RolloutStateChanged {
        rollout_id: Uuid,
        project_id: Uuid,
        from: RolloutState,
        to: RolloutState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RolloutApproved {
        rollout_id: Uuid,
        project_id: Uuid,
        user_id: Uuid,
        approvals: u32,
        approvals_needed: u32,
    },
    RolloutRejected {
        rollout_id: Uuid,
        project_id: Uuid,
        user_id: Uuid,
        comment: String,
    },
    DriftDetected {
        drift_event_id: Uuid,
        node_id: Uuid,
        project_id: Uuid,
        expected_bundle_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        actual_bundle_id: Option<Uuid>,
    },
    DriftResolved {
        drift_event_id: Uuid,
        node_id: Uuid,
        project_id: Uuid,
        resolution: DriftResolution,
    },
    DriftThresholdExceeded {
        project_id: Uuid,
        open_events: u64,
        threshold: u64,
    },
}

impl NotificationEvent {
    /// Topic name used by the broadcaster; doubles as the webhook event label.
    pub fn topic(&self) -> &'static str {
        match self {
            NotificationEvent::RolloutStateChanged { .. } => "rollout.state_changed",
            NotificationEvent::RolloutApproved { .. } => "rollout.approved",
            NotificationEvent::RolloutRejected { .. } => "rollout.rejected",
            NotificationEvent::DriftDetected { .. } => "drift.detected",
            NotificationEvent::DriftResolved { .. } => "drift.resolved",
            NotificationEvent::DriftThresholdExceeded { .. } => "drift.threshold_exceeded",
        }
    }

    pub fn project_id(&self) -> Uuid {
        match self {
            NotificationEvent::RolloutStateChanged { project_id, .. }
            | NotificationEvent::RolloutApproved { project_id, .. }
            | NotificationEvent::RolloutRejected { project_id, .. }
            | NotificationEvent::DriftDetected { project_id, .. }
            | NotificationEvent::DriftResolved { project_id, .. }
            | NotificationEvent::DriftThresholdExceeded { project_id, .. } => *project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_serializes_snake_case() {
        let ev = NotificationEvent::DriftDetected {
            drift_event_id: crate::new_id(),
            node_id: crate::new_id(),
            project_id: crate::new_id(),
            expected_bundle_id: crate::new_id(),
            actual_bundle_id: None,
        };
        let json = serde_json::to_string(&ev).expect("serialize");
        assert!(json.contains("\"event\":\"drift_detected\""));
        assert_eq!(ev.topic(), "drift.detected");
    }

    #[test]
    fn round_trip_state_change() {
        let ev = NotificationEvent::RolloutStateChanged {
            rollout_id: crate::new_id(),
            project_id: crate::new_id(),
            from: RolloutState::Running,
            to: RolloutState::Paused,
            reason: Some("max_unavailable_exceeded".into()),
        };
        let json = serde_json::to_string(&ev).expect("serialize");
        let back: NotificationEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ev);
    }
}
