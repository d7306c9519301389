//! Store abstraction for the Sentinel control plane.
//!
//! This crate provides a trait-based abstraction over durable persistence,
//! allowing the engine to run against either an embedded single-writer store
//! or a networked relational store. The engine never sees SQL or files; it
//! sees CRUD plus the conditional operations its state machines are built on:
//!
//! - [`Store::claim_bundle_for_compile`] - atomic `pending → compiling`
//! - [`Store::update_rollout_state`] - compare-and-swap rollout transitions
//! - [`Store::insert_rollout_plan`] - the plan transaction (steps + statuses
//!   + rollout transition, all or nothing)
//! - [`Store::cancel_rollout_with_reset`] - rollback transaction (state
//!   change + staged-pointer reset)
//!
//! The bundled [`MemoryStore`] keeps every table behind one async mutex, so
//! each trait call is a single serializable critical section. Multi-writer
//! callers (dispatcher workers, protocol handlers) rely on exactly that.

mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use sentinel_types::{
    ApiKey, Bundle, BundleManifest, BundlePromotion, DriftEvent, DriftResolution, EngineError,
    Environment, HealthCheckEndpoint, Node, NodeBundleStatus, NodeEvent, NodeGroup, NodeHeartbeat,
    NodeProgress, NodeStatus, Organization, Project, RiskLevel, RiskReason, Rollout,
    RolloutApproval, RolloutError, RolloutState, RolloutStep, SigningKey, StepState, User,
    ValidationRule,
};

pub use memory::{MemoryStore, StoreConfig};

/// Result alias used across the store surface.
pub type StoreResult<T> = Result<T, EngineError>;

/// Derived fields written in the single `compiling → compiled` update.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub checksum: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub manifest: BundleManifest,
    pub compiler_output: Option<String>,
    pub risk_level: RiskLevel,
    pub risk_reasons: Vec<RiskReason>,
    pub signature: Option<String>,
    pub signing_key_id: Option<Uuid>,
    pub sbom: Option<serde_json::Value>,
}

/// Node-row fields refreshed by a heartbeat, applied together with the
/// heartbeat append in one transaction.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub version: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub active_bundle_id: Option<Uuid>,
    pub staged_bundle_id: Option<Uuid>,
}

/// Optional fields carried along a rollout state transition.
#[derive(Debug, Clone, Default)]
pub struct RolloutStateFields {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<RolloutError>,
}

/// Optional fields carried along a step state transition.
#[derive(Debug, Clone, Default)]
pub struct StepStateFields {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<RolloutError>,
}

/// Timestamps stamped while advancing per-node rollout progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressStamps {
    pub staged_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_report_at: Option<DateTime<Utc>>,
}

/// Durable persistence for every control-plane entity.
///
/// All implementations must provide serializable semantics per call: a method
/// either observes and produces a consistent snapshot or fails. Methods that
/// encode a precondition (`from` states, uniqueness) return
/// [`EngineError::InvalidState`] when it does not hold.
#[async_trait]
pub trait Store: Send + Sync {
    // --- tenant tree ---

    async fn insert_organization(&self, org: Organization) -> StoreResult<()>;
    async fn get_organization(&self, id: Uuid) -> StoreResult<Organization>;
    async fn insert_project(&self, project: Project) -> StoreResult<()>;
    async fn get_project(&self, id: Uuid) -> StoreResult<Project>;
    async fn get_project_by_slug(&self, slug: &str) -> StoreResult<Project>;
    async fn list_projects(&self) -> StoreResult<Vec<Project>>;
    async fn update_project(&self, project: Project) -> StoreResult<()>;
    async fn insert_environment(&self, env: Environment) -> StoreResult<()>;
    /// Environments of a project ordered by `ordinal`.
    async fn list_environments(&self, project_id: Uuid) -> StoreResult<Vec<Environment>>;
    async fn insert_user(&self, user: User) -> StoreResult<()>;
    async fn get_user(&self, id: Uuid) -> StoreResult<User>;

    // --- identity material ---

    async fn insert_signing_key(&self, key: SigningKey) -> StoreResult<()>;
    async fn get_signing_key(&self, id: Uuid) -> StoreResult<SigningKey>;
    /// Most recently created key of the org that is active and unexpired.
    async fn active_signing_key(
        &self,
        org_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<SigningKey>>;
    async fn deactivate_signing_key(&self, id: Uuid) -> StoreResult<()>;
    async fn insert_api_key(&self, key: ApiKey) -> StoreResult<()>;
    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>>;
    async fn revoke_api_key(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    // --- bundles ---

    /// Fails with `invalid_state` on a duplicate `(project_id, version)`.
    async fn insert_bundle(&self, bundle: Bundle) -> StoreResult<()>;
    async fn get_bundle(&self, id: Uuid) -> StoreResult<Bundle>;
    /// Bundles of a project, newest first.
    async fn list_bundles(&self, project_id: Uuid) -> StoreResult<Vec<Bundle>>;
    /// Atomic `pending → compiling`. Returns false when the bundle is in any
    /// other state, so a second worker backs off.
    async fn claim_bundle_for_compile(&self, id: Uuid) -> StoreResult<bool>;
    /// Atomic `compiling → compiled` carrying every derived field.
    async fn finish_compile(&self, id: Uuid, artifact: CompiledArtifact) -> StoreResult<Bundle>;
    /// Atomic `compiling → failed` capturing compiler output.
    async fn fail_compile(&self, id: Uuid, compiler_output: String) -> StoreResult<Bundle>;
    /// `compiled → superseded`; used only for bundles no live rollout references.
    async fn mark_superseded(&self, id: Uuid) -> StoreResult<()>;
    /// Atomic `compiled → revoked` plus `reset_staged_for_bundle`, together.
    async fn revoke_bundle(&self, id: Uuid) -> StoreResult<Bundle>;
    /// Deletes a bundle in a deletable state.
    async fn delete_bundle(&self, id: Uuid) -> StoreResult<()>;
    /// Latest `compiled` bundle of the project; revoked and superseded are
    /// excluded.
    async fn latest_compiled_bundle(&self, project_id: Uuid) -> StoreResult<Option<Bundle>>;
    /// Non-terminal rollouts whose `bundle_id` is this bundle.
    async fn rollouts_referencing_bundle(&self, bundle_id: Uuid) -> StoreResult<Vec<Rollout>>;

    async fn insert_promotion(&self, promotion: BundlePromotion) -> StoreResult<()>;
    async fn list_promotions(&self, bundle_id: Uuid) -> StoreResult<Vec<BundlePromotion>>;

    async fn insert_validation_rule(&self, rule: ValidationRule) -> StoreResult<()>;
    async fn list_validation_rules(&self, project_id: Uuid) -> StoreResult<Vec<ValidationRule>>;

    async fn insert_health_check(&self, endpoint: HealthCheckEndpoint) -> StoreResult<()>;
    async fn get_health_check(&self, id: Uuid) -> StoreResult<HealthCheckEndpoint>;

    // --- nodes ---

    /// Fails with `invalid_state` on a duplicate `(project_id, name)`.
    async fn insert_node(&self, node: Node) -> StoreResult<()>;
    async fn get_node(&self, id: Uuid) -> StoreResult<Node>;
    /// Whole-row update keyed by id.
    async fn put_node(&self, node: Node) -> StoreResult<()>;
    /// Nodes of a project in registration order.
    async fn list_nodes(&self, project_id: Uuid) -> StoreResult<Vec<Node>>;
    async fn find_node_by_key_hash(&self, key_hash: &str) -> StoreResult<Option<Node>>;
    /// Project nodes whose labels are a superset of `labels`, in registration
    /// order. Implementations may use a JSON containment operator or a joined
    /// attributes table.
    async fn nodes_by_labels(
        &self,
        project_id: Uuid,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<Node>>;
    /// Resolves ids in the given order, silently dropping missing ids and ids
    /// outside the project.
    async fn nodes_by_ids(&self, project_id: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Node>>;

    /// Heartbeat transaction: refresh the node row (`online`, `last_seen_at`,
    /// plus provided fields) and append the heartbeat, enforcing the
    /// retention cap.
    async fn apply_heartbeat(
        &self,
        node_id: Uuid,
        seen_at: DateTime<Utc>,
        update: HeartbeatUpdate,
        heartbeat: NodeHeartbeat,
    ) -> StoreResult<Node>;
    async fn latest_heartbeat(&self, node_id: Uuid) -> StoreResult<Option<NodeHeartbeat>>;
    async fn list_heartbeats(&self, node_id: Uuid, limit: usize) -> StoreResult<Vec<NodeHeartbeat>>;
    /// Single-pass bulk sweep: every `online` node not seen since
    /// `stale_before` moves to `offline`. Returns the ids swept. Idempotent.
    async fn sweep_stale_nodes(&self, stale_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;
    /// Bulk write of `staged_bundle_id`.
    async fn set_staged_bundle(&self, node_ids: &[Uuid], bundle_id: Uuid) -> StoreResult<()>;
    /// Bulk write of `expected_bundle_id`. Only the rollout engine calls this.
    async fn set_expected_bundle(&self, node_ids: &[Uuid], bundle_id: Uuid) -> StoreResult<()>;
    /// Clears `staged_bundle_id` on any node still pointing at this bundle.
    /// Returns how many rows changed.
    async fn reset_staged_for_bundle(&self, bundle_id: Uuid) -> StoreResult<u64>;

    async fn insert_node_events(&self, events: Vec<NodeEvent>) -> StoreResult<()>;
    async fn list_node_events(&self, node_id: Uuid, limit: usize) -> StoreResult<Vec<NodeEvent>>;
    /// Drop heartbeat rows beyond `cap` per node. Returns rows removed.
    async fn trim_heartbeats(&self, cap: usize) -> StoreResult<u64>;
    /// Drop node-event rows beyond `cap` per node. Returns rows removed.
    async fn trim_node_events(&self, cap: usize) -> StoreResult<u64>;

    async fn insert_group(&self, group: NodeGroup) -> StoreResult<()>;
    async fn get_group(&self, id: Uuid) -> StoreResult<NodeGroup>;
    async fn list_groups(&self, project_id: Uuid) -> StoreResult<Vec<NodeGroup>>;

    // --- drift ---

    /// Inserts an unresolved drift event. Fails with `invalid_state` if the
    /// node already has one: at most one unresolved event per node.
    async fn insert_drift_event(&self, event: DriftEvent) -> StoreResult<()>;
    async fn get_drift_event(&self, id: Uuid) -> StoreResult<DriftEvent>;
    async fn active_drift_event(&self, node_id: Uuid) -> StoreResult<Option<DriftEvent>>;
    /// Tags an unresolved event with a resolution (e.g. `rollout_started`)
    /// without closing it; the event stays open until the node converges.
    async fn tag_drift_event(&self, id: Uuid, resolution: DriftResolution) -> StoreResult<()>;
    /// Stamps `resolved_at`/`resolution` on an unresolved event.
    async fn resolve_drift_event(
        &self,
        id: Uuid,
        resolution: DriftResolution,
        at: DateTime<Utc>,
    ) -> StoreResult<DriftEvent>;
    async fn list_drift_events(
        &self,
        project_id: Uuid,
        include_resolved: bool,
    ) -> StoreResult<Vec<DriftEvent>>;
    async fn count_open_drift_events(&self, project_id: Uuid) -> StoreResult<u64>;

    // --- rollouts ---

    async fn insert_rollout(&self, rollout: Rollout) -> StoreResult<()>;
    async fn get_rollout(&self, id: Uuid) -> StoreResult<Rollout>;
    async fn list_rollouts(&self, project_id: Uuid) -> StoreResult<Vec<Rollout>>;
    /// Pending rollouts whose `scheduled_at` has passed.
    async fn due_scheduled_rollouts(&self, now: DateTime<Utc>) -> StoreResult<Vec<Rollout>>;
    /// Compare-and-swap state transition; `invalid_state` when the current
    /// state is not `from`. Concurrent tickers rely on this as their guard.
    async fn update_rollout_state(
        &self,
        id: Uuid,
        from: RolloutState,
        to: RolloutState,
        fields: RolloutStateFields,
    ) -> StoreResult<Rollout>;
    async fn set_approval_state(
        &self,
        id: Uuid,
        state: sentinel_types::ApprovalState,
    ) -> StoreResult<Rollout>;
    /// Fails with `already_approved` on a duplicate `(rollout_id, user_id)`.
    async fn insert_approval(&self, approval: RolloutApproval) -> StoreResult<()>;
    async fn count_approvals(&self, rollout_id: Uuid) -> StoreResult<u32>;

    /// The plan transaction: insert steps and per-node statuses and move the
    /// rollout `pending → running`, all in one atomic unit.
    async fn insert_rollout_plan(
        &self,
        rollout_id: Uuid,
        steps: Vec<RolloutStep>,
        statuses: Vec<NodeBundleStatus>,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Rollout>;
    /// Steps of a rollout ordered by `step_index`.
    async fn list_steps(&self, rollout_id: Uuid) -> StoreResult<Vec<RolloutStep>>;
    /// Compare-and-swap step transition.
    async fn update_step_state(
        &self,
        step_id: Uuid,
        from: StepState,
        to: StepState,
        fields: StepStateFields,
    ) -> StoreResult<RolloutStep>;
    async fn list_node_statuses(&self, rollout_id: Uuid) -> StoreResult<Vec<NodeBundleStatus>>;
    /// Advance the named nodes' progression, enforcing monotonicity; rows
    /// already at or past `to` are left untouched.
    async fn advance_node_statuses(
        &self,
        rollout_id: Uuid,
        node_ids: &[Uuid],
        to: NodeProgress,
        stamps: ProgressStamps,
    ) -> StoreResult<()>;

    /// The rollback transaction: move the rollout to `cancelled` from one of
    /// `allowed_from` and clear `staged_bundle_id` on every node still staged
    /// on its bundle.
    async fn cancel_rollout_with_reset(
        &self,
        rollout_id: Uuid,
        allowed_from: &[RolloutState],
    ) -> StoreResult<Rollout>;

    // --- liveness helpers used by sweeps and stats ---

    /// Count of nodes per status within a project.
    async fn count_nodes_by_status(
        &self,
        project_id: Uuid,
    ) -> StoreResult<BTreeMap<NodeStatus, u64>>;
}
