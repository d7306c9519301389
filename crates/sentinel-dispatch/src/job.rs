//! The closed set of background jobs the dispatcher executes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sentinel_types::NotificationEvent;

/// A unit of background work. Every job is safe to redeliver: handlers drive
/// all transitions through conditional store operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Claim and compile one bundle. Keyed: at most one queued per bundle.
    CompileBundle { bundle_id: Uuid },
    /// Drive one rollout's state machine forward by at most one transition.
    /// Keyed: at most one queued per rollout.
    TickRollout { rollout_id: Uuid },
    /// Mark stale nodes offline. Cron.
    LivenessSweep,
    /// Reconcile drift across all online nodes. Cron; the primary path is
    /// per-heartbeat.
    DriftScan,
    /// Plan pending rollouts whose `scheduled_at` has passed. Cron.
    ScheduledRolloutScan,
    /// Fan one notification out to the configured endpoints. Best-effort.
    DeliverWebhook { event: NotificationEvent },
    /// Enforce the per-node heartbeat row cap. Cron.
    HeartbeatCleanup,
    /// Enforce the per-node event row cap. Cron.
    EventCleanup,
}

impl Job {
    /// Dedup key for jobs where a second queued instance adds nothing.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            Job::CompileBundle { bundle_id } => Some(format!("compile:{bundle_id}")),
            Job::TickRollout { rollout_id } => Some(format!("tick:{rollout_id}")),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Job::CompileBundle { .. } => "compile_bundle",
            Job::TickRollout { .. } => "tick_rollout",
            Job::LivenessSweep => "liveness_sweep",
            Job::DriftScan => "drift_scan",
            Job::ScheduledRolloutScan => "scheduled_rollout_scan",
            Job::DeliverWebhook { .. } => "deliver_webhook",
            Job::HeartbeatCleanup => "heartbeat_cleanup",
            Job::EventCleanup => "event_cleanup",
        }
    }

    /// Delivery attempts before the job is dropped. Webhooks get a few;
    /// everything else is either re-armed by its own logic (ticks) or cron.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Job::DeliverWebhook { .. } => 5,
            Job::CompileBundle { .. } => 3,
            _ => 1,
        }
    }
}
