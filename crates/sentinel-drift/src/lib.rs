//! Drift engine.
//!
//! Drift is the condition where a node's running bundle differs from the
//! control plane's expectation. Reconciliation runs synchronously on every
//! heartbeat and opportunistically from the `DriftScan` cron; it maintains
//! the invariant of at most one unresolved drift event per node, and can
//! feed back into the rollout engine with a single-node remediation rollout.
//!
//! Remediation is rate-limited per `(node, expected bundle)` pair so a
//! remediation rollout that itself fails cannot spin the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sentinel_dispatch::JobQueue;
use sentinel_rollout::{RolloutEngine, RolloutIn};
use sentinel_store::Store;
use sentinel_types::{
    DriftEvent, DriftResolution, EngineError, Node, NodeStatus, NotificationEvent, clock,
};

/// Drift engine knobs.
#[derive(Debug, Clone)]
pub struct DriftConfig {
    /// Minimum spacing between remediation rollouts for the same
    /// `(node, expected bundle)` pair.
    pub remediation_interval: Duration,
    /// Open-event count per project beyond which a threshold notification
    /// fires during scans.
    pub open_event_threshold: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            remediation_interval: Duration::from_secs(900),
            open_event_threshold: 10,
        }
    }
}

/// What one reconciliation pass concluded for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftOutcome {
    /// Nothing expected, nothing open.
    NoDrift,
    /// The expectation is gone; the open event auto-cleared.
    Cleared,
    /// The node converged; the open event resolved.
    Resolved,
    /// A new event was opened; remediation may have been enqueued.
    Opened { remediated: bool },
    /// An event was already open; no new action was taken.
    AlreadyOpen { remediated: bool },
}

/// Open/closed counts used by operator dashboards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftStats {
    pub open: u64,
    pub resolved: u64,
    pub total: u64,
}

/// Store-backed drift detection and remediation.
pub struct DriftEngine {
    store: Arc<dyn Store>,
    rollouts: RolloutEngine,
    queue: JobQueue,
    config: DriftConfig,
    /// Last remediation per `(node, expected bundle)`.
    remediation_ledger: Mutex<HashMap<(Uuid, Uuid), DateTime<Utc>>>,
}

impl DriftEngine {
    pub fn new(
        store: Arc<dyn Store>,
        rollouts: RolloutEngine,
        queue: JobQueue,
        config: DriftConfig,
    ) -> Self {
        Self {
            store,
            rollouts,
            queue,
            config,
            remediation_ledger: Mutex::new(HashMap::new()),
        }
    }

    fn notify(&self, event: NotificationEvent) {
        self.queue.enqueue(sentinel_dispatch::Job::DeliverWebhook { event });
    }

    /// Reconcile one node's observed state against its expectation.
    pub async fn reconcile_node(&self, node: &Node) -> Result<DriftOutcome, EngineError> {
        let open = self.store.active_drift_event(node.id).await?;

        let Some(expected) = node.expected_bundle_id else {
            // No expectation, so nothing to drift from.
            if let Some(event) = open {
                let resolved = self
                    .store
                    .resolve_drift_event(event.id, DriftResolution::AutoCleared, clock::now())
                    .await?;
                self.notify_resolved(&resolved);
                return Ok(DriftOutcome::Cleared);
            }
            return Ok(DriftOutcome::NoDrift);
        };

        if node.active_bundle_id == Some(expected) {
            if let Some(event) = open {
                let resolved = self
                    .store
                    .resolve_drift_event(event.id, DriftResolution::Manual, clock::now())
                    .await?;
                info!(node = %node.id, "drift resolved: node converged");
                self.notify_resolved(&resolved);
                return Ok(DriftOutcome::Resolved);
            }
            return Ok(DriftOutcome::NoDrift);
        }

        // Mismatch. Open an event if none exists, then consider remediation;
        // offline nodes are tracked but never remediated until they return.
        let (event, opened) = match open {
            Some(event) => (event, false),
            None => {
                let event = DriftEvent {
                    id: sentinel_types::new_id(),
                    node_id: node.id,
                    project_id: node.project_id,
                    expected_bundle_id: expected,
                    actual_bundle_id: node.active_bundle_id,
                    detected_at: clock::now(),
                    resolved_at: None,
                    resolution: None,
                };
                self.store.insert_drift_event(event.clone()).await?;
                warn!(
                    node = %node.id,
                    expected = %expected,
                    actual = ?node.active_bundle_id,
                    "drift detected"
                );
                self.notify(NotificationEvent::DriftDetected {
                    drift_event_id: event.id,
                    node_id: node.id,
                    project_id: node.project_id,
                    expected_bundle_id: expected,
                    actual_bundle_id: node.active_bundle_id,
                });
                (event, true)
            }
        };

        let mut remediated = false;
        if node.status == NodeStatus::Online {
            let project = self.store.get_project(node.project_id).await?;
            if project.settings.drift_auto_remediation
                && self.remediation_allowed(node.id, expected).await
            {
                remediated = self.remediate(node, expected, &event).await;
            }
        }

        Ok(if opened {
            DriftOutcome::Opened { remediated }
        } else {
            DriftOutcome::AlreadyOpen { remediated }
        })
    }

    /// Enqueue an all-at-once single-node rollout back to the expectation.
    async fn remediate(&self, node: &Node, expected: Uuid, event: &DriftEvent) -> bool {
        let input = RolloutIn::immediate(
            node.project_id,
            expected,
            vec![node.id],
            Uuid::nil(),
        );
        let result = async {
            let created = self.rollouts.create_rollout(input).await?;
            self.rollouts.plan_rollout(created.id).await
        }
        .await;
        match result {
            Ok(rollout) => {
                info!(node = %node.id, rollout = %rollout.id, "drift remediation rollout planned");
                if let Err(err) = self
                    .store
                    .tag_drift_event(event.id, DriftResolution::RolloutStarted)
                    .await
                {
                    debug!(event = %event.id, error = %err, "could not tag drift event");
                }
                true
            }
            Err(err) => {
                warn!(node = %node.id, error = %err, "drift remediation failed to start");
                false
            }
        }
    }

    async fn remediation_allowed(&self, node_id: Uuid, expected: Uuid) -> bool {
        let mut ledger = self.remediation_ledger.lock().await;
        let now = clock::now();
        let allowed = ledger
            .get(&(node_id, expected))
            .is_none_or(|last| (now - *last).num_seconds() >= self.config.remediation_interval.as_secs() as i64);
        if allowed {
            ledger.insert((node_id, expected), now);
        }
        allowed
    }

    /// Reconcile every node of every project; the cron-driven secondary path.
    /// Also raises a threshold notification for noisy projects.
    pub async fn scan(&self) -> Result<u64, EngineError> {
        let mut reconciled = 0;
        for project in self.store.list_projects().await? {
            for node in self.store.list_nodes(project.id).await? {
                self.reconcile_node(&node).await?;
                reconciled += 1;
            }
            let open = self.store.count_open_drift_events(project.id).await?;
            if open > self.config.open_event_threshold {
                self.notify(NotificationEvent::DriftThresholdExceeded {
                    project_id: project.id,
                    open_events: open,
                    threshold: self.config.open_event_threshold,
                });
            }
        }
        Ok(reconciled)
    }

    /// Operator-initiated resolution of one event.
    pub async fn resolve_manual(&self, event_id: Uuid) -> Result<DriftEvent, EngineError> {
        let resolved = self
            .store
            .resolve_drift_event(event_id, DriftResolution::Manual, clock::now())
            .await?;
        self.notify_resolved(&resolved);
        Ok(resolved)
    }

    /// Operator-initiated resolution of every open event in a project.
    pub async fn resolve_all(&self, project_id: Uuid) -> Result<u64, EngineError> {
        let open = self.store.list_drift_events(project_id, false).await?;
        let mut resolved = 0;
        for event in open {
            let done = self
                .store
                .resolve_drift_event(event.id, DriftResolution::Manual, clock::now())
                .await?;
            self.notify_resolved(&done);
            resolved += 1;
        }
        Ok(resolved)
    }

    pub async fn stats(&self, project_id: Uuid) -> Result<DriftStats, EngineError> {
        let all = self.store.list_drift_events(project_id, true).await?;
        let open = all.iter().filter(|e| !e.is_resolved()).count() as u64;
        Ok(DriftStats { open, resolved: all.len() as u64 - open, total: all.len() as u64 })
    }

    fn notify_resolved(&self, event: &DriftEvent) {
        if let Some(resolution) = event.resolution {
            self.notify(NotificationEvent::DriftResolved {
                drift_event_id: event.id,
                node_id: event.node_id,
                project_id: event.project_id,
                resolution,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sentinel_rollout::{HealthProber, RolloutConfig};
    use sentinel_store::{CompiledArtifact, MemoryStore};
    use sentinel_types::{
        BundleManifest, HealthCheckEndpoint, Organization, Project, ProjectSettings, RolloutState,
        RolloutStrategy, TargetSelector,
    };

    struct NullProber;

    #[async_trait]
    impl HealthProber for NullProber {
        async fn probe(&self, _endpoint: &HealthCheckEndpoint) -> bool {
            true
        }
    }

    struct Fixture {
        store: Arc<dyn Store>,
        engine: DriftEngine,
        project_id: Uuid,
    }

    async fn fixture(auto_remediation: bool) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let org_id = sentinel_types::new_id();
        let project_id = sentinel_types::new_id();
        store
            .insert_organization(Organization {
                id: org_id,
                name: "acme".into(),
                created_at: clock::now(),
            })
            .await
            .expect("org");
        store
            .insert_project(Project {
                id: project_id,
                org_id,
                name: "edge".into(),
                slug: "edge".into(),
                settings: ProjectSettings {
                    drift_auto_remediation: auto_remediation,
                    ..Default::default()
                },
                created_at: clock::now(),
            })
            .await
            .expect("project");
        let rollouts = RolloutEngine::new(
            Arc::clone(&store),
            JobQueue::detached(),
            Arc::new(NullProber),
            RolloutConfig::default(),
        );
        let engine = DriftEngine::new(
            Arc::clone(&store),
            rollouts,
            JobQueue::detached(),
            DriftConfig::default(),
        );
        Fixture { store, engine, project_id }
    }

    async fn compiled_bundle(fx: &Fixture, version: &str) -> Uuid {
        let bundle = sentinel_types::Bundle::new(fx.project_id, version, "listener \"web\" {}");
        let id = bundle.id;
        fx.store.insert_bundle(bundle).await.expect("bundle");
        fx.store.claim_bundle_for_compile(id).await.expect("claim");
        fx.store
            .finish_compile(
                id,
                CompiledArtifact {
                    checksum: "cd".repeat(32),
                    size_bytes: 64,
                    storage_key: "bundles/x/y.tar.zst".into(),
                    manifest: BundleManifest {
                        bundle_id: id,
                        assembled_at: clock::now(),
                        files: vec![],
                    },
                    compiler_output: None,
                    risk_level: Default::default(),
                    risk_reasons: vec![],
                    signature: None,
                    signing_key_id: None,
                    sbom: None,
                },
            )
            .await
            .expect("compile");
        id
    }

    async fn node(
        fx: &Fixture,
        name: &str,
        status: NodeStatus,
        active: Option<Uuid>,
        expected: Option<Uuid>,
    ) -> Node {
        let now = clock::now();
        let node = Node {
            id: sentinel_types::new_id(),
            project_id: fx.project_id,
            name: name.into(),
            labels: Default::default(),
            capabilities: Default::default(),
            version: None,
            status,
            last_seen_at: now,
            registered_at: now,
            ip: None,
            hostname: None,
            node_key_hash: format!("{name}-hash"),
            active_bundle_id: active,
            staged_bundle_id: None,
            expected_bundle_id: expected,
            pinned_bundle_id: None,
            min_bundle_version: None,
            max_bundle_version: None,
            environment_id: None,
            runtime_config_hash: None,
        };
        fx.store.insert_node(node.clone()).await.expect("node");
        node
    }

    #[tokio::test]
    async fn auto_remediation_opens_tags_and_plans_a_rollout() {
        let fx = fixture(true).await;
        let expected = compiled_bundle(&fx, "1.1.0").await;
        let actual = compiled_bundle(&fx, "1.0.0").await;
        let n1 = node(&fx, "n1", NodeStatus::Online, Some(actual), Some(expected)).await;

        let outcome = fx.engine.reconcile_node(&n1).await.expect("reconcile");
        assert_eq!(outcome, DriftOutcome::Opened { remediated: true });

        let event = fx
            .store
            .active_drift_event(n1.id)
            .await
            .expect("query")
            .expect("open event");
        assert_eq!(event.expected_bundle_id, expected);
        assert_eq!(event.actual_bundle_id, Some(actual));
        assert_eq!(event.resolution, Some(DriftResolution::RolloutStarted));
        assert!(!event.is_resolved());

        // An all-at-once rollout to the expected bundle targets just this node.
        let rollouts = fx.store.list_rollouts(fx.project_id).await.expect("rollouts");
        let remediation = rollouts.iter().find(|r| r.bundle_id == expected).expect("remediation");
        assert_eq!(remediation.strategy, RolloutStrategy::AllAtOnce);
        assert_eq!(remediation.state, RolloutState::Running);
        assert_eq!(
            remediation.target_selector,
            TargetSelector::NodeIds { node_ids: vec![n1.id] }
        );
    }

    #[tokio::test]
    async fn remediation_is_rate_limited_per_node_and_bundle() {
        let fx = fixture(true).await;
        let expected = compiled_bundle(&fx, "1.1.0").await;
        let n1 = node(&fx, "n1", NodeStatus::Online, None, Some(expected)).await;

        let first = fx.engine.reconcile_node(&n1).await.expect("reconcile");
        assert_eq!(first, DriftOutcome::Opened { remediated: true });
        let second = fx.engine.reconcile_node(&n1).await.expect("reconcile");
        assert_eq!(second, DriftOutcome::AlreadyOpen { remediated: false });

        // Still exactly one remediation rollout.
        let rollouts = fx.store.list_rollouts(fx.project_id).await.expect("rollouts");
        assert_eq!(rollouts.iter().filter(|r| r.bundle_id == expected).count(), 1);
        // And still exactly one unresolved event.
        assert_eq!(
            fx.store.count_open_drift_events(fx.project_id).await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn offline_nodes_are_tracked_but_not_remediated() {
        let fx = fixture(true).await;
        let expected = compiled_bundle(&fx, "1.1.0").await;
        let n1 = node(&fx, "n1", NodeStatus::Offline, None, Some(expected)).await;

        let outcome = fx.engine.reconcile_node(&n1).await.expect("reconcile");
        assert_eq!(outcome, DriftOutcome::Opened { remediated: false });
        assert!(fx.store.active_drift_event(n1.id).await.expect("query").is_some());
        assert!(fx.store.list_rollouts(fx.project_id).await.expect("rollouts").is_empty());
    }

    #[tokio::test]
    async fn convergence_resolves_the_open_event() {
        let fx = fixture(false).await;
        let expected = compiled_bundle(&fx, "1.1.0").await;
        let mut n1 = node(&fx, "n1", NodeStatus::Online, None, Some(expected)).await;

        assert_eq!(
            fx.engine.reconcile_node(&n1).await.expect("reconcile"),
            DriftOutcome::Opened { remediated: false }
        );

        n1.active_bundle_id = Some(expected);
        fx.store.put_node(n1.clone()).await.expect("update");
        assert_eq!(
            fx.engine.reconcile_node(&n1).await.expect("reconcile"),
            DriftOutcome::Resolved
        );
        let events = fx.store.list_drift_events(fx.project_id, true).await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resolution, Some(DriftResolution::Manual));
        assert!(events[0].is_resolved());
    }

    #[tokio::test]
    async fn cleared_expectation_auto_clears() {
        let fx = fixture(false).await;
        let expected = compiled_bundle(&fx, "1.1.0").await;
        let mut n1 = node(&fx, "n1", NodeStatus::Online, None, Some(expected)).await;
        fx.engine.reconcile_node(&n1).await.expect("open");

        n1.expected_bundle_id = None;
        fx.store.put_node(n1.clone()).await.expect("update");
        assert_eq!(
            fx.engine.reconcile_node(&n1).await.expect("reconcile"),
            DriftOutcome::Cleared
        );
        let events = fx.store.list_drift_events(fx.project_id, true).await.expect("events");
        assert_eq!(events[0].resolution, Some(DriftResolution::AutoCleared));
    }

    #[tokio::test]
    async fn scan_covers_projects_and_reports_stats() {
        let fx = fixture(false).await;
        let expected = compiled_bundle(&fx, "1.1.0").await;
        node(&fx, "drifting", NodeStatus::Online, None, Some(expected)).await;
        node(&fx, "fine", NodeStatus::Online, Some(expected), Some(expected)).await;

        let reconciled = fx.engine.scan().await.expect("scan");
        assert_eq!(reconciled, 2);

        let stats = fx.engine.stats(fx.project_id).await.expect("stats");
        assert_eq!(stats.open, 1);
        assert_eq!(stats.total, 1);

        let resolved = fx.engine.resolve_all(fx.project_id).await.expect("resolve all");
        assert_eq!(resolved, 1);
        let stats = fx.engine.stats(fx.project_id).await.expect("stats");
        assert_eq!(stats.open, 0);
        assert_eq!(stats.resolved, 1);
    }
}
