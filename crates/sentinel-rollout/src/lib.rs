//! Rollout engine.
//!
//! A rollout moves a set of nodes from whatever they run to a target bundle,
//! in ordered batches, gated on health. The engine splits into a planner
//! (resolve targets, filter, chunk, one plan transaction) and a ticker (the
//! state machine driver in [`tick`]), with an approval gate in front and
//! operator transitions on the side.
//!
//! Concurrency model: any number of tickers may race on one rollout; every
//! transition is a compare-and-swap against the store, so a second writer
//! observes a stale precondition and exits. A tick performs at most one
//! state advance and re-arms itself through the dispatcher.

pub mod health;
pub mod plan;
mod tick;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use sentinel_dispatch::{Job, JobQueue};
use sentinel_store::{RolloutStateFields, Store};
use sentinel_types::{
    ApprovalState, EngineError, HealthGates, NodeBundleStatus, NotificationEvent, Rollout,
    RolloutApproval, RolloutState, RolloutStep, RolloutStrategy, TargetSelector, clock,
};

pub use health::{HealthProber, HttpProber, evaluate_gates};
pub use tick::TickOutcome;

/// Engine knobs.
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Delay before a re-armed tick fires.
    pub tick_delay: Duration,
    /// When `max_unavailable == 0`, the source semantics require every node
    /// of the step to activate, offline ones included; a step with an
    /// offline node then waits until it returns or the deadline fires. Set
    /// false to subtract offline nodes from the requirement instead.
    pub strict_required_counts_offline: bool,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self { tick_delay: Duration::from_secs(1), strict_required_counts_offline: true }
    }
}

/// Input for creating a rollout.
#[derive(Debug, Clone)]
pub struct RolloutIn {
    pub project_id: Uuid,
    pub bundle_id: Uuid,
    pub target_selector: TargetSelector,
    pub strategy: RolloutStrategy,
    pub batch_size: u32,
    pub batch_percentage: Option<u32>,
    pub max_unavailable: u32,
    pub progress_deadline_seconds: u64,
    pub health_gates: HealthGates,
    pub custom_health_checks: Vec<Uuid>,
    pub auto_rollback: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by_id: Uuid,
}

impl RolloutIn {
    /// A minimal all-at-once rollout, as used by drift remediation and
    /// deadline rollback.
    pub fn immediate(
        project_id: Uuid,
        bundle_id: Uuid,
        node_ids: Vec<Uuid>,
        created_by_id: Uuid,
    ) -> Self {
        Self {
            project_id,
            bundle_id,
            target_selector: TargetSelector::NodeIds { node_ids },
            strategy: RolloutStrategy::AllAtOnce,
            batch_size: 1,
            batch_percentage: None,
            max_unavailable: 0,
            progress_deadline_seconds: 600,
            health_gates: HealthGates::default(),
            custom_health_checks: Vec::new(),
            auto_rollback: false,
            scheduled_at: None,
            created_by_id,
        }
    }
}

/// The rollout engine: planner, ticker, approval gate, operator transitions.
#[derive(Clone)]
pub struct RolloutEngine {
    store: Arc<dyn Store>,
    queue: JobQueue,
    prober: Arc<dyn HealthProber>,
    config: RolloutConfig,
}

impl RolloutEngine {
    pub fn new(
        store: Arc<dyn Store>,
        queue: JobQueue,
        prober: Arc<dyn HealthProber>,
        config: RolloutConfig,
    ) -> Self {
        Self { store, queue, prober, config }
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn prober(&self) -> &Arc<dyn HealthProber> {
        &self.prober
    }

    pub(crate) fn config(&self) -> &RolloutConfig {
        &self.config
    }

    pub(crate) fn notify(&self, event: NotificationEvent) {
        self.queue.enqueue(Job::DeliverWebhook { event });
    }

    pub(crate) fn schedule_tick(&self, rollout_id: Uuid) {
        self.queue
            .enqueue_in(Job::TickRollout { rollout_id }, self.config.tick_delay);
    }

    /// Create a rollout. Projects that require approval get
    /// `pending_approval`; everything else is immediately plannable.
    pub async fn create_rollout(&self, input: RolloutIn) -> Result<Rollout, EngineError> {
        let project = self.store.get_project(input.project_id).await?;
        let bundle = self.store.get_bundle(input.bundle_id).await?;
        if bundle.project_id != project.id {
            return Err(EngineError::BundleNotFound(bundle.id));
        }
        let approval_state = if project.settings.require_approval {
            ApprovalState::PendingApproval
        } else {
            ApprovalState::NotRequired
        };
        let rollout = Rollout {
            id: sentinel_types::new_id(),
            project_id: input.project_id,
            bundle_id: input.bundle_id,
            target_selector: input.target_selector,
            strategy: input.strategy,
            batch_size: input.batch_size.max(1),
            batch_percentage: input.batch_percentage,
            max_unavailable: input.max_unavailable,
            progress_deadline_seconds: input.progress_deadline_seconds,
            health_gates: input.health_gates,
            custom_health_checks: input.custom_health_checks,
            auto_rollback: input.auto_rollback,
            scheduled_at: input.scheduled_at,
            state: RolloutState::Pending,
            approval_state,
            started_at: None,
            completed_at: None,
            error: None,
            created_by_id: input.created_by_id,
            created_at: clock::now(),
        };
        self.store.insert_rollout(rollout.clone()).await?;
        info!(rollout = %rollout.id, bundle = %rollout.bundle_id, "rollout created");
        Ok(rollout)
    }

    /// Record one user's approval; promotes the rollout to `approved` once
    /// the project's threshold is met.
    pub async fn approve(&self, rollout_id: Uuid, user_id: Uuid) -> Result<Rollout, EngineError> {
        let rollout = self.store.get_rollout(rollout_id).await?;
        if rollout.approval_state != ApprovalState::PendingApproval {
            return Err(EngineError::invalid_state(format!(
                "rollout approval state is {:?}",
                rollout.approval_state
            )));
        }
        if user_id == rollout.created_by_id {
            return Err(EngineError::SelfApproval);
        }
        let project = self.store.get_project(rollout.project_id).await?;
        let user = self.store.get_user(user_id).await?;
        if user.org_id != project.org_id || !user.role.can_approve() {
            return Err(EngineError::NotAuthorized);
        }
        self.store
            .insert_approval(RolloutApproval {
                id: sentinel_types::new_id(),
                rollout_id,
                user_id,
                comment: None,
                created_at: clock::now(),
            })
            .await?;
        let approvals = self.store.count_approvals(rollout_id).await?;
        let needed = project.settings.approvals_needed;
        let rollout = if approvals >= needed {
            let approved = self
                .store
                .set_approval_state(rollout_id, ApprovalState::Approved)
                .await?;
            info!(rollout = %rollout_id, approvals, "rollout approved");
            approved
        } else {
            rollout
        };
        self.notify(NotificationEvent::RolloutApproved {
            rollout_id,
            project_id: rollout.project_id,
            user_id,
            approvals,
            approvals_needed: needed,
        });
        Ok(rollout)
    }

    /// Reject a pending approval. Requires a non-empty comment; the rollout
    /// stays `pending` and can still be cancelled.
    pub async fn reject(
        &self,
        rollout_id: Uuid,
        user_id: Uuid,
        comment: &str,
    ) -> Result<Rollout, EngineError> {
        if comment.trim().is_empty() {
            return Err(EngineError::CommentRequired);
        }
        let rollout = self.store.get_rollout(rollout_id).await?;
        if rollout.approval_state != ApprovalState::PendingApproval {
            return Err(EngineError::invalid_state(format!(
                "rollout approval state is {:?}",
                rollout.approval_state
            )));
        }
        let project = self.store.get_project(rollout.project_id).await?;
        let user = self.store.get_user(user_id).await?;
        if user.org_id != project.org_id || !user.role.can_approve() {
            return Err(EngineError::NotAuthorized);
        }
        let rejected = self
            .store
            .set_approval_state(rollout_id, ApprovalState::Rejected)
            .await?;
        self.notify(NotificationEvent::RolloutRejected {
            rollout_id,
            project_id: rejected.project_id,
            user_id,
            comment: comment.to_string(),
        });
        Ok(rejected)
    }

    /// Plan an approved (or approval-free) rollout: resolve targets, filter,
    /// chunk, and commit steps + statuses + the `pending → running`
    /// transition in one transaction. Schedules the first tick.
    pub async fn plan_rollout(&self, rollout_id: Uuid) -> Result<Rollout, EngineError> {
        let rollout = self.store.get_rollout(rollout_id).await?;
        if !rollout.approval_state.allows_planning() {
            return Err(EngineError::ApprovalRequired);
        }
        if rollout.state != RolloutState::Pending {
            return Err(EngineError::invalid_state(format!(
                "cannot plan a {:?} rollout",
                rollout.state
            )));
        }
        let bundle = self.store.get_bundle(rollout.bundle_id).await?;
        if !bundle.status.is_distributable() {
            return Err(EngineError::BundleNotCompiled(bundle.id));
        }

        let targets =
            plan::resolve_targets(&self.store, rollout.project_id, &rollout.target_selector)
                .await?;
        let targets: Vec<_> = targets
            .into_iter()
            .filter(|node| node.accepts_bundle(rollout.bundle_id))
            .collect();
        let targets = plan::filter_version_window(targets, &bundle.version);
        if targets.is_empty() {
            return Err(EngineError::NoTargetNodes);
        }

        let target_ids: Vec<Uuid> = targets.iter().map(|n| n.id).collect();
        let batches = plan::chunk_batches(
            &target_ids,
            rollout.strategy,
            rollout.batch_size,
            rollout.batch_percentage,
        );

        let steps: Vec<RolloutStep> = batches
            .iter()
            .enumerate()
            .map(|(index, node_ids)| RolloutStep {
                id: sentinel_types::new_id(),
                rollout_id,
                step_index: index as u32,
                node_ids: node_ids.clone(),
                state: Default::default(),
                started_at: None,
                completed_at: None,
                error: None,
            })
            .collect();
        let statuses: Vec<NodeBundleStatus> = target_ids
            .iter()
            .map(|node_id| NodeBundleStatus {
                id: sentinel_types::new_id(),
                rollout_id,
                node_id: *node_id,
                state: Default::default(),
                staged_at: None,
                activated_at: None,
                verified_at: None,
                last_report_at: None,
            })
            .collect();

        let planned = self
            .store
            .insert_rollout_plan(rollout_id, steps, statuses, clock::now())
            .await?;
        info!(
            rollout = %rollout_id,
            nodes = target_ids.len(),
            steps = batches.len(),
            "rollout planned"
        );
        self.notify(NotificationEvent::RolloutStateChanged {
            rollout_id,
            project_id: planned.project_id,
            from: RolloutState::Pending,
            to: RolloutState::Running,
            reason: None,
        });
        self.schedule_tick(rollout_id);
        Ok(planned)
    }

    /// Plan every pending rollout whose schedule has come due.
    pub async fn plan_due_scheduled(&self) -> Result<usize, EngineError> {
        let due = self.store.due_scheduled_rollouts(clock::now()).await?;
        let mut planned = 0;
        for rollout in due {
            match self.plan_rollout(rollout.id).await {
                Ok(_) => planned += 1,
                Err(err) => {
                    tracing::warn!(rollout = %rollout.id, error = %err, "scheduled plan failed");
                }
            }
        }
        Ok(planned)
    }

    /// `running → paused`; a no-op in any other state.
    pub async fn pause(&self, rollout_id: Uuid) -> Result<Rollout, EngineError> {
        match self
            .store
            .update_rollout_state(
                rollout_id,
                RolloutState::Running,
                RolloutState::Paused,
                RolloutStateFields::default(),
            )
            .await
        {
            Ok(paused) => {
                self.notify(NotificationEvent::RolloutStateChanged {
                    rollout_id,
                    project_id: paused.project_id,
                    from: RolloutState::Running,
                    to: RolloutState::Paused,
                    reason: None,
                });
                Ok(paused)
            }
            Err(EngineError::InvalidState { .. }) => self.store.get_rollout(rollout_id).await,
            Err(err) => Err(err),
        }
    }

    /// `paused → running`; re-arms the ticker.
    pub async fn resume(&self, rollout_id: Uuid) -> Result<Rollout, EngineError> {
        let resumed = self
            .store
            .update_rollout_state(
                rollout_id,
                RolloutState::Paused,
                RolloutState::Running,
                RolloutStateFields::default(),
            )
            .await?;
        self.notify(NotificationEvent::RolloutStateChanged {
            rollout_id,
            project_id: resumed.project_id,
            from: RolloutState::Paused,
            to: RolloutState::Running,
            reason: None,
        });
        self.schedule_tick(rollout_id);
        Ok(resumed)
    }

    /// Cancel from `running`, `paused`, or a `pending` rollout whose
    /// approval was rejected. A pending rollout still collecting approvals
    /// (or approved but unplanned) is not cancellable.
    pub async fn cancel(&self, rollout_id: Uuid) -> Result<Rollout, EngineError> {
        let rollout = self.store.get_rollout(rollout_id).await?;
        let mut allowed = vec![RolloutState::Running, RolloutState::Paused];
        if rollout.approval_state == ApprovalState::Rejected {
            allowed.push(RolloutState::Pending);
        }
        for from in allowed {
            match self
                .store
                .update_rollout_state(
                    rollout_id,
                    from,
                    RolloutState::Cancelled,
                    RolloutStateFields {
                        completed_at: Some(clock::now()),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(cancelled) => {
                    self.notify(NotificationEvent::RolloutStateChanged {
                        rollout_id,
                        project_id: cancelled.project_id,
                        from,
                        to: RolloutState::Cancelled,
                        reason: None,
                    });
                    return Ok(cancelled);
                }
                Err(EngineError::InvalidState { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(EngineError::invalid_state("rollout is not cancellable"))
    }

    /// Cancel and clear `staged_bundle_id` on every node still staged on this
    /// rollout's bundle, transactionally.
    pub async fn rollback(&self, rollout_id: Uuid) -> Result<Rollout, EngineError> {
        let from = self.store.get_rollout(rollout_id).await?.state;
        let cancelled = self
            .store
            .cancel_rollout_with_reset(
                rollout_id,
                &[RolloutState::Running, RolloutState::Paused],
            )
            .await?;
        self.notify(NotificationEvent::RolloutStateChanged {
            rollout_id,
            project_id: cancelled.project_id,
            from,
            to: RolloutState::Cancelled,
            reason: Some("rollback".into()),
        });
        Ok(cancelled)
    }
}
