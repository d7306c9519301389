//! The ticker: one invocation, at most one state advance.
//!
//! Ticks never sleep; "not yet" is expressed by re-arming another tick
//! through the dispatcher. Every transition is a compare-and-swap, so a
//! duplicate or concurrent tick observes a stale precondition and becomes a
//! no-op.

use std::collections::BTreeMap;

use tracing::{info, warn};
use uuid::Uuid;

use sentinel_store::{ProgressStamps, RolloutStateFields, StepStateFields};
use sentinel_types::{
    Bundle, DriftResolution, EngineError, Node, NodeProgress, NodeStatus, NotificationEvent,
    Rollout, RolloutError, RolloutState, RolloutStep, StepState, clock,
};

use crate::{RolloutEngine, RolloutIn};

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do: wrong state, missing rollout, or a lost CAS race.
    NoOp,
    /// A pending step was started and its nodes staged.
    StepStarted(u32),
    /// The active step made no progress; another tick is armed.
    Waiting,
    /// Activation quorum reached; the step moved to verification.
    StepVerifying(u32),
    /// Verification passed; the step completed.
    StepCompleted(u32),
    RolloutCompleted,
    RolloutPaused,
    RolloutFailed,
}

/// Collapse a lost CAS race into `None`.
fn benign<T>(result: Result<T, EngineError>) -> Result<Option<T>, EngineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(EngineError::InvalidState { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

impl RolloutEngine {
    /// Drive one rollout forward by at most one transition.
    pub async fn tick(&self, rollout_id: Uuid) -> Result<TickOutcome, EngineError> {
        let rollout = match self.store().get_rollout(rollout_id).await {
            Ok(rollout) => rollout,
            Err(EngineError::NotFound { .. }) => return Ok(TickOutcome::NoOp),
            Err(err) => return Err(err),
        };
        if rollout.state != RolloutState::Running {
            return Ok(TickOutcome::NoOp);
        }
        let steps = self.store().list_steps(rollout_id).await?;

        match steps.iter().find(|s| s.state.is_active()).cloned() {
            None => match steps.iter().find(|s| s.state == StepState::Pending).cloned() {
                None => self.complete_rollout(&rollout, &steps).await,
                Some(next) => self.start_step(&rollout, next).await,
            },
            Some(active) => self.advance_step(&rollout, active).await,
        }
    }

    async fn start_step(
        &self,
        rollout: &Rollout,
        step: RolloutStep,
    ) -> Result<TickOutcome, EngineError> {
        let bundle = self.store().get_bundle(rollout.bundle_id).await?;
        if !bundle.status.is_distributable() {
            return self.fail_bundle_revoked(rollout, &step, StepState::Pending).await;
        }
        let now = clock::now();
        let started = benign(
            self.store()
                .update_step_state(
                    step.id,
                    StepState::Pending,
                    StepState::Running,
                    StepStateFields { started_at: Some(now), ..Default::default() },
                )
                .await,
        )?;
        if started.is_none() {
            return Ok(TickOutcome::NoOp);
        }
        self.store()
            .set_staged_bundle(&step.node_ids, rollout.bundle_id)
            .await?;
        self.store()
            .advance_node_statuses(
                rollout.id,
                &step.node_ids,
                NodeProgress::Staging,
                ProgressStamps { staged_at: Some(now), ..Default::default() },
            )
            .await?;
        info!(rollout = %rollout.id, step = step.step_index, nodes = step.node_ids.len(), "step started");
        self.schedule_tick(rollout.id);
        Ok(TickOutcome::StepStarted(step.step_index))
    }

    async fn advance_step(
        &self,
        rollout: &Rollout,
        step: RolloutStep,
    ) -> Result<TickOutcome, EngineError> {
        // Revocation is re-checked while a step is in flight, not just at
        // step start; a revoked bundle fails the rollout on the next tick.
        let bundle = self.store().get_bundle(rollout.bundle_id).await?;
        if !bundle.status.is_distributable() {
            return self.fail_bundle_revoked(rollout, &step, step.state).await;
        }
        let nodes = self
            .store()
            .nodes_by_ids(rollout.project_id, &step.node_ids)
            .await?;
        let unavailable =
            nodes.iter().filter(|n| n.status != NodeStatus::Online).count() as u32;

        match step.state {
            StepState::Running => {
                self.check_activation(rollout, &step, &bundle, &nodes, unavailable)
                    .await
            }
            StepState::Verifying => self.verify_step(rollout, &step, &nodes).await,
            _ => Ok(TickOutcome::NoOp),
        }
    }

    async fn check_activation(
        &self,
        rollout: &Rollout,
        step: &RolloutStep,
        bundle: &Bundle,
        nodes: &[Node],
        unavailable: u32,
    ) -> Result<TickOutcome, EngineError> {
        let activated = nodes
            .iter()
            .filter(|n| n.active_bundle_id == Some(bundle.id))
            .count();

        if rollout.max_unavailable > 0 && unavailable > rollout.max_unavailable {
            let paused = benign(
                self.store()
                    .update_rollout_state(
                        rollout.id,
                        RolloutState::Running,
                        RolloutState::Paused,
                        RolloutStateFields {
                            error: Some(RolloutError::new("max_unavailable_exceeded")),
                            ..Default::default()
                        },
                    )
                    .await,
            )?;
            if paused.is_none() {
                return Ok(TickOutcome::NoOp);
            }
            warn!(rollout = %rollout.id, step = step.step_index, unavailable, "paused: max_unavailable exceeded");
            self.notify(NotificationEvent::RolloutStateChanged {
                rollout_id: rollout.id,
                project_id: rollout.project_id,
                from: RolloutState::Running,
                to: RolloutState::Paused,
                reason: Some("max_unavailable_exceeded".into()),
            });
            return Ok(TickOutcome::RolloutPaused);
        }

        let step_size = step.node_ids.len();
        let required = if rollout.max_unavailable > 0 {
            step_size.saturating_sub(rollout.max_unavailable as usize)
        } else if self.config().strict_required_counts_offline {
            step_size
        } else {
            step_size.saturating_sub(unavailable as usize)
        };

        if activated >= required && activated > 0 {
            let advanced = benign(
                self.store()
                    .update_step_state(
                        step.id,
                        StepState::Running,
                        StepState::Verifying,
                        StepStateFields::default(),
                    )
                    .await,
            )?;
            if advanced.is_none() {
                return Ok(TickOutcome::NoOp);
            }
            self.store()
                .advance_node_statuses(
                    rollout.id,
                    &step.node_ids,
                    NodeProgress::Activating,
                    ProgressStamps {
                        last_report_at: Some(clock::now()),
                        ..Default::default()
                    },
                )
                .await?;
            self.schedule_tick(rollout.id);
            return Ok(TickOutcome::StepVerifying(step.step_index));
        }

        self.deadline_or_wait(rollout, step).await
    }

    async fn verify_step(
        &self,
        rollout: &Rollout,
        step: &RolloutStep,
        nodes: &[Node],
    ) -> Result<TickOutcome, EngineError> {
        // With max_unavailable == 0 every node must answer for itself;
        // otherwise offline nodes are excluded from gate evaluation.
        let available: Vec<&Node> = if rollout.max_unavailable == 0 {
            nodes.iter().collect()
        } else {
            nodes.iter().filter(|n| n.status == NodeStatus::Online).collect()
        };

        let mut passed = true;
        for node in &available {
            let heartbeat = self.store().latest_heartbeat(node.id).await?;
            if !crate::health::evaluate_gates(&rollout.health_gates, heartbeat.as_ref()) {
                passed = false;
                break;
            }
        }
        if passed {
            for endpoint_id in &rollout.custom_health_checks {
                let endpoint = self.store().get_health_check(*endpoint_id).await?;
                if !self.prober().probe(&endpoint).await {
                    passed = false;
                    break;
                }
            }
        }

        if !passed {
            return self.deadline_or_wait(rollout, step).await;
        }

        let now = clock::now();
        let completed = benign(
            self.store()
                .update_step_state(
                    step.id,
                    StepState::Verifying,
                    StepState::Completed,
                    StepStateFields { completed_at: Some(now), ..Default::default() },
                )
                .await,
        )?;
        if completed.is_none() {
            return Ok(TickOutcome::NoOp);
        }
        self.store()
            .advance_node_statuses(
                rollout.id,
                &step.node_ids,
                NodeProgress::Active,
                ProgressStamps {
                    activated_at: Some(now),
                    verified_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        self.store()
            .set_expected_bundle(&step.node_ids, rollout.bundle_id)
            .await?;
        info!(rollout = %rollout.id, step = step.step_index, "step completed");
        self.schedule_tick(rollout.id);
        Ok(TickOutcome::StepCompleted(step.step_index))
    }

    async fn complete_rollout(
        &self,
        rollout: &Rollout,
        steps: &[RolloutStep],
    ) -> Result<TickOutcome, EngineError> {
        let completed = benign(
            self.store()
                .update_rollout_state(
                    rollout.id,
                    RolloutState::Running,
                    RolloutState::Completed,
                    RolloutStateFields {
                        completed_at: Some(clock::now()),
                        ..Default::default()
                    },
                )
                .await,
        )?;
        if completed.is_none() {
            return Ok(TickOutcome::NoOp);
        }

        // Nodes the rollout converged are no longer drifting.
        for step in steps {
            for node_id in &step.node_ids {
                if let Some(event) = self.store().active_drift_event(*node_id).await?
                    && event.expected_bundle_id == rollout.bundle_id
                {
                    self.store()
                        .resolve_drift_event(event.id, DriftResolution::RolloutCompleted, clock::now())
                        .await?;
                    self.notify(NotificationEvent::DriftResolved {
                        drift_event_id: event.id,
                        node_id: *node_id,
                        project_id: rollout.project_id,
                        resolution: DriftResolution::RolloutCompleted,
                    });
                }
            }
        }

        info!(rollout = %rollout.id, "rollout completed");
        self.notify(NotificationEvent::RolloutStateChanged {
            rollout_id: rollout.id,
            project_id: rollout.project_id,
            from: RolloutState::Running,
            to: RolloutState::Completed,
            reason: None,
        });
        Ok(TickOutcome::RolloutCompleted)
    }

    async fn deadline_or_wait(
        &self,
        rollout: &Rollout,
        step: &RolloutStep,
    ) -> Result<TickOutcome, EngineError> {
        let now = clock::now();
        let elapsed = step
            .started_at
            .map(|started| (now - started).num_seconds())
            .unwrap_or(0);
        if elapsed <= rollout.progress_deadline_seconds as i64 {
            self.schedule_tick(rollout.id);
            return Ok(TickOutcome::Waiting);
        }

        let failed_step = benign(
            self.store()
                .update_step_state(
                    step.id,
                    step.state,
                    StepState::Failed,
                    StepStateFields {
                        completed_at: Some(now),
                        error: Some(RolloutError::deadline(elapsed)),
                        ..Default::default()
                    },
                )
                .await,
        )?;
        if failed_step.is_none() {
            return Ok(TickOutcome::NoOp);
        }
        self.fail_nodes_not_active(rollout.id, &step.node_ids).await?;

        let failed = benign(
            self.store()
                .update_rollout_state(
                    rollout.id,
                    RolloutState::Running,
                    RolloutState::Failed,
                    RolloutStateFields {
                        completed_at: Some(now),
                        error: Some(RolloutError::step_deadline(step.step_index, elapsed)),
                        ..Default::default()
                    },
                )
                .await,
        )?;
        warn!(
            rollout = %rollout.id,
            step = step.step_index,
            elapsed,
            "rollout failed: step deadline exceeded"
        );
        if failed.is_some() {
            self.notify(NotificationEvent::RolloutStateChanged {
                rollout_id: rollout.id,
                project_id: rollout.project_id,
                from: RolloutState::Running,
                to: RolloutState::Failed,
                reason: Some("step_deadline_exceeded".into()),
            });
            if rollout.auto_rollback {
                self.auto_rollback(rollout, step).await;
            }
        }
        Ok(TickOutcome::RolloutFailed)
    }

    async fn fail_bundle_revoked(
        &self,
        rollout: &Rollout,
        step: &RolloutStep,
        from: StepState,
    ) -> Result<TickOutcome, EngineError> {
        let now = clock::now();
        let failed_step = benign(
            self.store()
                .update_step_state(
                    step.id,
                    from,
                    StepState::Failed,
                    StepStateFields {
                        completed_at: Some(now),
                        error: Some(RolloutError::new("bundle_revoked")),
                        ..Default::default()
                    },
                )
                .await,
        )?;
        if failed_step.is_none() {
            return Ok(TickOutcome::NoOp);
        }
        self.fail_nodes_not_active(rollout.id, &step.node_ids).await?;
        let failed = benign(
            self.store()
                .update_rollout_state(
                    rollout.id,
                    RolloutState::Running,
                    RolloutState::Failed,
                    RolloutStateFields {
                        completed_at: Some(now),
                        error: Some(RolloutError::new("bundle_revoked")),
                        ..Default::default()
                    },
                )
                .await,
        )?;
        warn!(rollout = %rollout.id, step = step.step_index, "rollout failed: bundle revoked");
        if failed.is_some() {
            self.notify(NotificationEvent::RolloutStateChanged {
                rollout_id: rollout.id,
                project_id: rollout.project_id,
                from: RolloutState::Running,
                to: RolloutState::Failed,
                reason: Some("bundle_revoked".into()),
            });
        }
        Ok(TickOutcome::RolloutFailed)
    }

    /// Mark every step node that never reached `active` as failed.
    async fn fail_nodes_not_active(
        &self,
        rollout_id: Uuid,
        node_ids: &[Uuid],
    ) -> Result<(), EngineError> {
        let statuses = self.store().list_node_statuses(rollout_id).await?;
        let not_active: Vec<Uuid> = statuses
            .iter()
            .filter(|s| node_ids.contains(&s.node_id) && s.state != NodeProgress::Active)
            .map(|s| s.node_id)
            .collect();
        self.store()
            .advance_node_statuses(
                rollout_id,
                &not_active,
                NodeProgress::Failed,
                ProgressStamps::default(),
            )
            .await
    }

    /// Best-effort revert after a deadline failure: target the failed step's
    /// nodes with the bundle most of them still run.
    async fn auto_rollback(&self, rollout: &Rollout, step: &RolloutStep) {
        let candidate = match self.rollback_candidate(rollout, step).await {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                info!(rollout = %rollout.id, "auto-rollback skipped: no candidate bundle");
                return;
            }
            Err(err) => {
                warn!(rollout = %rollout.id, error = %err, "auto-rollback candidate lookup failed");
                return;
            }
        };
        let input = RolloutIn {
            progress_deadline_seconds: rollout.progress_deadline_seconds,
            ..RolloutIn::immediate(
                rollout.project_id,
                candidate,
                step.node_ids.clone(),
                rollout.created_by_id,
            )
        };
        let result = async {
            let created = self.create_rollout(input).await?;
            self.plan_rollout(created.id).await
        }
        .await;
        match result {
            Ok(planned) => {
                info!(rollout = %rollout.id, rollback = %planned.id, bundle = %candidate, "auto-rollback planned")
            }
            Err(err) => warn!(rollout = %rollout.id, error = %err, "auto-rollback failed"),
        }
    }

    /// The previous `active_bundle_id` most common among the step's nodes;
    /// ties break to the highest count, then the smallest id.
    async fn rollback_candidate(
        &self,
        rollout: &Rollout,
        step: &RolloutStep,
    ) -> Result<Option<Uuid>, EngineError> {
        let nodes = self
            .store()
            .nodes_by_ids(rollout.project_id, &step.node_ids)
            .await?;
        let mut counts: BTreeMap<Uuid, usize> = BTreeMap::new();
        for node in nodes {
            if let Some(bundle_id) = node.active_bundle_id
                && bundle_id != rollout.bundle_id
            {
                *counts.entry(bundle_id).or_insert(0) += 1;
            }
        }
        Ok(counts
            .iter()
            .max_by_key(|(id, count)| (**count, std::cmp::Reverse(**id)))
            .map(|(id, _)| *id))
    }
}
