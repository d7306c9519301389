//! In-memory store.
//!
//! Every table lives behind a single async mutex, so each [`Store`] call is
//! one serializable critical section. That is the whole concurrency story:
//! dispatcher workers and protocol handlers race freely, and the conditional
//! operations decide who wins.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use sentinel_types::{
    ApiKey, ApprovalState, Bundle, BundlePromotion, BundleStatus, DriftEvent, DriftResolution,
    EngineError, Environment, HealthCheckEndpoint, Node, NodeBundleStatus, NodeEvent, NodeGroup,
    NodeHeartbeat, NodeProgress, NodeStatus, Organization, Project, Rollout, RolloutApproval,
    RolloutState, RolloutStep, SigningKey, StepState, User, ValidationRule, clock,
};

use crate::{
    CompiledArtifact, HeartbeatUpdate, ProgressStamps, RolloutStateFields, StepStateFields, Store,
    StoreResult,
};

/// Retention knobs for append-only tables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Heartbeat rows kept per node.
    pub heartbeat_cap: usize,
    /// Node-event rows kept per node.
    pub node_event_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { heartbeat_cap: 100, node_event_cap: 500 }
    }
}

#[derive(Default)]
struct Tables {
    organizations: BTreeMap<Uuid, Organization>,
    projects: BTreeMap<Uuid, Project>,
    environments: BTreeMap<Uuid, Environment>,
    users: BTreeMap<Uuid, User>,
    signing_keys: BTreeMap<Uuid, SigningKey>,
    api_keys: BTreeMap<Uuid, ApiKey>,
    bundles: BTreeMap<Uuid, Bundle>,
    promotions: BTreeMap<Uuid, BundlePromotion>,
    validation_rules: BTreeMap<Uuid, ValidationRule>,
    health_checks: BTreeMap<Uuid, HealthCheckEndpoint>,
    nodes: BTreeMap<Uuid, Node>,
    /// Insertion order of node ids; `list_nodes` is registration-ordered.
    node_order: Vec<Uuid>,
    heartbeats: BTreeMap<Uuid, Vec<NodeHeartbeat>>,
    node_events: BTreeMap<Uuid, Vec<NodeEvent>>,
    groups: BTreeMap<Uuid, NodeGroup>,
    drift_events: BTreeMap<Uuid, DriftEvent>,
    rollouts: BTreeMap<Uuid, Rollout>,
    steps: BTreeMap<Uuid, RolloutStep>,
    node_statuses: BTreeMap<Uuid, NodeBundleStatus>,
    approvals: BTreeMap<Uuid, RolloutApproval>,
}

/// Single-process [`Store`] implementation backed by in-memory tables.
pub struct MemoryStore {
    config: StoreConfig,
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config, tables: Mutex::new(Tables::default()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

fn ordered_nodes(t: &Tables, project_id: Uuid) -> Vec<Node> {
    t.node_order
        .iter()
        .filter_map(|id| t.nodes.get(id))
        .filter(|n| n.project_id == project_id)
        .cloned()
        .collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_organization(&self, org: Organization) -> StoreResult<()> {
        self.tables.lock().await.organizations.insert(org.id, org);
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> StoreResult<Organization> {
        self.tables
            .lock()
            .await
            .organizations
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("organization", id))
    }

    async fn insert_project(&self, project: Project) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.projects.values().any(|p| p.slug == project.slug) {
            return Err(EngineError::invalid_state(format!(
                "project slug {} already exists",
                project.slug
            )));
        }
        t.projects.insert(project.id, project);
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> StoreResult<Project> {
        self.tables
            .lock()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("project", id))
    }

    async fn get_project_by_slug(&self, slug: &str) -> StoreResult<Project> {
        self.tables
            .lock()
            .await
            .projects
            .values()
            .find(|p| p.slug == slug)
            .cloned()
            .ok_or(EngineError::not_found("project", Uuid::nil()))
    }

    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        Ok(self.tables.lock().await.projects.values().cloned().collect())
    }

    async fn update_project(&self, project: Project) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if !t.projects.contains_key(&project.id) {
            return Err(EngineError::not_found("project", project.id));
        }
        t.projects.insert(project.id, project);
        Ok(())
    }

    async fn insert_environment(&self, env: Environment) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.environments
            .values()
            .any(|e| e.project_id == env.project_id && e.ordinal == env.ordinal)
        {
            return Err(EngineError::invalid_state(format!(
                "environment ordinal {} already taken",
                env.ordinal
            )));
        }
        t.environments.insert(env.id, env);
        Ok(())
    }

    async fn list_environments(&self, project_id: Uuid) -> StoreResult<Vec<Environment>> {
        let t = self.tables.lock().await;
        let mut envs: Vec<Environment> = t
            .environments
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        envs.sort_by_key(|e| e.ordinal);
        Ok(envs)
    }

    async fn insert_user(&self, user: User) -> StoreResult<()> {
        self.tables.lock().await.users.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<User> {
        self.tables
            .lock()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("user", id))
    }

    async fn insert_signing_key(&self, key: SigningKey) -> StoreResult<()> {
        self.tables.lock().await.signing_keys.insert(key.id, key);
        Ok(())
    }

    async fn get_signing_key(&self, id: Uuid) -> StoreResult<SigningKey> {
        self.tables
            .lock()
            .await
            .signing_keys
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownKey)
    }

    async fn active_signing_key(
        &self,
        org_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<SigningKey>> {
        let t = self.tables.lock().await;
        Ok(t.signing_keys
            .values()
            .filter(|k| k.org_id == org_id && k.usable_at(at))
            .max_by_key(|k| (k.created_at, k.id))
            .cloned())
    }

    async fn deactivate_signing_key(&self, id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let key = t.signing_keys.get_mut(&id).ok_or(EngineError::UnknownKey)?;
        key.active = false;
        Ok(())
    }

    async fn insert_api_key(&self, key: ApiKey) -> StoreResult<()> {
        self.tables.lock().await.api_keys.insert(key.id, key);
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let t = self.tables.lock().await;
        Ok(t.api_keys.values().find(|k| k.key_hash == key_hash).cloned())
    }

    async fn revoke_api_key(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let key = t
            .api_keys
            .get_mut(&id)
            .ok_or(EngineError::not_found("api_key", id))?;
        key.revoked_at.get_or_insert(at);
        Ok(())
    }

    async fn insert_bundle(&self, bundle: Bundle) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.bundles
            .values()
            .any(|b| b.project_id == bundle.project_id && b.version == bundle.version)
        {
            return Err(EngineError::invalid_state(format!(
                "bundle version {} already exists in project",
                bundle.version
            )));
        }
        t.bundles.insert(bundle.id, bundle);
        Ok(())
    }

    async fn get_bundle(&self, id: Uuid) -> StoreResult<Bundle> {
        self.tables
            .lock()
            .await
            .bundles
            .get(&id)
            .cloned()
            .ok_or(EngineError::BundleNotFound(id))
    }

    async fn list_bundles(&self, project_id: Uuid) -> StoreResult<Vec<Bundle>> {
        let t = self.tables.lock().await;
        let mut bundles: Vec<Bundle> = t
            .bundles
            .values()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        bundles.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(bundles)
    }

    async fn claim_bundle_for_compile(&self, id: Uuid) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        let bundle = t.bundles.get_mut(&id).ok_or(EngineError::BundleNotFound(id))?;
        if bundle.status != BundleStatus::Pending {
            return Ok(false);
        }
        bundle.status = BundleStatus::Compiling;
        bundle.updated_at = clock::now();
        Ok(true)
    }

    async fn finish_compile(&self, id: Uuid, artifact: CompiledArtifact) -> StoreResult<Bundle> {
        let mut t = self.tables.lock().await;
        let bundle = t.bundles.get_mut(&id).ok_or(EngineError::BundleNotFound(id))?;
        if bundle.status != BundleStatus::Compiling {
            return Err(EngineError::invalid_state(format!(
                "finish_compile on {:?} bundle",
                bundle.status
            )));
        }
        bundle.status = BundleStatus::Compiled;
        bundle.checksum = Some(artifact.checksum);
        bundle.size_bytes = Some(artifact.size_bytes);
        bundle.storage_key = Some(artifact.storage_key);
        bundle.manifest = Some(artifact.manifest);
        bundle.compiler_output = artifact.compiler_output;
        bundle.risk_level = artifact.risk_level;
        bundle.risk_reasons = artifact.risk_reasons;
        bundle.signature = artifact.signature;
        bundle.signing_key_id = artifact.signing_key_id;
        bundle.sbom = artifact.sbom;
        bundle.updated_at = clock::now();
        Ok(bundle.clone())
    }

    async fn fail_compile(&self, id: Uuid, compiler_output: String) -> StoreResult<Bundle> {
        let mut t = self.tables.lock().await;
        let bundle = t.bundles.get_mut(&id).ok_or(EngineError::BundleNotFound(id))?;
        if bundle.status != BundleStatus::Compiling {
            return Err(EngineError::invalid_state(format!(
                "fail_compile on {:?} bundle",
                bundle.status
            )));
        }
        bundle.status = BundleStatus::Failed;
        bundle.compiler_output = Some(compiler_output);
        bundle.updated_at = clock::now();
        Ok(bundle.clone())
    }

    async fn mark_superseded(&self, id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let bundle = t.bundles.get_mut(&id).ok_or(EngineError::BundleNotFound(id))?;
        if bundle.status == BundleStatus::Compiled {
            bundle.status = BundleStatus::Superseded;
            bundle.updated_at = clock::now();
        }
        Ok(())
    }

    async fn revoke_bundle(&self, id: Uuid) -> StoreResult<Bundle> {
        let mut t = self.tables.lock().await;
        let bundle = t.bundles.get_mut(&id).ok_or(EngineError::BundleNotFound(id))?;
        if bundle.status != BundleStatus::Compiled {
            return Err(EngineError::invalid_state(format!(
                "cannot revoke a {:?} bundle",
                bundle.status
            )));
        }
        bundle.status = BundleStatus::Revoked;
        bundle.updated_at = clock::now();
        let revoked = bundle.clone();
        for node in t.nodes.values_mut() {
            if node.staged_bundle_id == Some(id) {
                node.staged_bundle_id = None;
            }
        }
        Ok(revoked)
    }

    async fn delete_bundle(&self, id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let bundle = t.bundles.get(&id).ok_or(EngineError::BundleNotFound(id))?;
        if !bundle.status.is_deletable() {
            return Err(EngineError::invalid_state(format!(
                "cannot delete a {:?} bundle",
                bundle.status
            )));
        }
        t.bundles.remove(&id);
        Ok(())
    }

    async fn latest_compiled_bundle(&self, project_id: Uuid) -> StoreResult<Option<Bundle>> {
        let t = self.tables.lock().await;
        Ok(t.bundles
            .values()
            .filter(|b| b.project_id == project_id && b.status == BundleStatus::Compiled)
            .max_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)))
            .cloned())
    }

    async fn rollouts_referencing_bundle(&self, bundle_id: Uuid) -> StoreResult<Vec<Rollout>> {
        let t = self.tables.lock().await;
        Ok(t.rollouts
            .values()
            .filter(|r| r.bundle_id == bundle_id && !r.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn insert_promotion(&self, promotion: BundlePromotion) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.promotions.values().any(|p| {
            p.bundle_id == promotion.bundle_id && p.environment_id == promotion.environment_id
        }) {
            return Err(EngineError::invalid_state(
                "bundle already promoted to environment",
            ));
        }
        t.promotions.insert(promotion.id, promotion);
        Ok(())
    }

    async fn list_promotions(&self, bundle_id: Uuid) -> StoreResult<Vec<BundlePromotion>> {
        let t = self.tables.lock().await;
        Ok(t.promotions
            .values()
            .filter(|p| p.bundle_id == bundle_id)
            .cloned()
            .collect())
    }

    async fn insert_validation_rule(&self, rule: ValidationRule) -> StoreResult<()> {
        self.tables.lock().await.validation_rules.insert(rule.id, rule);
        Ok(())
    }

    async fn list_validation_rules(&self, project_id: Uuid) -> StoreResult<Vec<ValidationRule>> {
        let t = self.tables.lock().await;
        Ok(t.validation_rules
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_health_check(&self, endpoint: HealthCheckEndpoint) -> StoreResult<()> {
        self.tables.lock().await.health_checks.insert(endpoint.id, endpoint);
        Ok(())
    }

    async fn get_health_check(&self, id: Uuid) -> StoreResult<HealthCheckEndpoint> {
        self.tables
            .lock()
            .await
            .health_checks
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("health_check", id))
    }

    async fn insert_node(&self, node: Node) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.nodes
            .values()
            .any(|n| n.project_id == node.project_id && n.name == node.name)
        {
            return Err(EngineError::invalid_state(format!(
                "node name {} already registered in project",
                node.name
            )));
        }
        t.node_order.push(node.id);
        t.nodes.insert(node.id, node);
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> StoreResult<Node> {
        self.tables
            .lock()
            .await
            .nodes
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("node", id))
    }

    async fn put_node(&self, node: Node) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if !t.nodes.contains_key(&node.id) {
            return Err(EngineError::not_found("node", node.id));
        }
        t.nodes.insert(node.id, node);
        Ok(())
    }

    async fn list_nodes(&self, project_id: Uuid) -> StoreResult<Vec<Node>> {
        let t = self.tables.lock().await;
        Ok(ordered_nodes(&t, project_id))
    }

    async fn find_node_by_key_hash(&self, key_hash: &str) -> StoreResult<Option<Node>> {
        let t = self.tables.lock().await;
        Ok(t.nodes.values().find(|n| n.node_key_hash == key_hash).cloned())
    }

    async fn nodes_by_labels(
        &self,
        project_id: Uuid,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<Node>> {
        let t = self.tables.lock().await;
        Ok(ordered_nodes(&t, project_id)
            .into_iter()
            .filter(|n| n.matches_labels(labels))
            .collect())
    }

    async fn nodes_by_ids(&self, project_id: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Node>> {
        let t = self.tables.lock().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = t.nodes.get(id)
                && node.project_id == project_id
                && !out.iter().any(|n: &Node| n.id == *id)
            {
                out.push(node.clone());
            }
        }
        Ok(out)
    }

    async fn apply_heartbeat(
        &self,
        node_id: Uuid,
        seen_at: DateTime<Utc>,
        update: HeartbeatUpdate,
        heartbeat: NodeHeartbeat,
    ) -> StoreResult<Node> {
        let mut t = self.tables.lock().await;
        let node = t
            .nodes
            .get_mut(&node_id)
            .ok_or(EngineError::not_found("node", node_id))?;
        node.status = NodeStatus::Online;
        node.last_seen_at = seen_at;
        if update.version.is_some() {
            node.version = update.version;
        }
        if update.ip.is_some() {
            node.ip = update.ip;
        }
        if update.hostname.is_some() {
            node.hostname = update.hostname;
        }
        if let Some(active) = update.active_bundle_id {
            node.active_bundle_id = Some(active);
        }
        if let Some(staged) = update.staged_bundle_id {
            node.staged_bundle_id = Some(staged);
        }
        let updated = node.clone();

        let rows = t.heartbeats.entry(node_id).or_default();
        rows.push(heartbeat);
        let cap = self.config.heartbeat_cap;
        if rows.len() > cap {
            let excess = rows.len() - cap;
            rows.drain(..excess);
        }
        Ok(updated)
    }

    async fn latest_heartbeat(&self, node_id: Uuid) -> StoreResult<Option<NodeHeartbeat>> {
        let t = self.tables.lock().await;
        Ok(t.heartbeats.get(&node_id).and_then(|rows| rows.last().cloned()))
    }

    async fn list_heartbeats(&self, node_id: Uuid, limit: usize) -> StoreResult<Vec<NodeHeartbeat>> {
        let t = self.tables.lock().await;
        Ok(t.heartbeats
            .get(&node_id)
            .map(|rows| rows.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn sweep_stale_nodes(&self, stale_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut t = self.tables.lock().await;
        let mut swept = Vec::new();
        for node in t.nodes.values_mut() {
            if node.status == NodeStatus::Online && node.last_seen_at < stale_before {
                node.status = NodeStatus::Offline;
                swept.push(node.id);
            }
        }
        Ok(swept)
    }

    async fn set_staged_bundle(&self, node_ids: &[Uuid], bundle_id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        for id in node_ids {
            if let Some(node) = t.nodes.get_mut(id) {
                node.staged_bundle_id = Some(bundle_id);
            }
        }
        Ok(())
    }

    async fn set_expected_bundle(&self, node_ids: &[Uuid], bundle_id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        for id in node_ids {
            if let Some(node) = t.nodes.get_mut(id) {
                node.expected_bundle_id = Some(bundle_id);
            }
        }
        Ok(())
    }

    async fn reset_staged_for_bundle(&self, bundle_id: Uuid) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let mut changed = 0;
        for node in t.nodes.values_mut() {
            if node.staged_bundle_id == Some(bundle_id) {
                node.staged_bundle_id = None;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn insert_node_events(&self, events: Vec<NodeEvent>) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let cap = self.config.node_event_cap;
        for event in events {
            let rows = t.node_events.entry(event.node_id).or_default();
            rows.push(event);
            if rows.len() > cap {
                let excess = rows.len() - cap;
                rows.drain(..excess);
            }
        }
        Ok(())
    }

    async fn list_node_events(&self, node_id: Uuid, limit: usize) -> StoreResult<Vec<NodeEvent>> {
        let t = self.tables.lock().await;
        Ok(t.node_events
            .get(&node_id)
            .map(|rows| rows.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn trim_heartbeats(&self, cap: usize) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let mut removed = 0;
        for rows in t.heartbeats.values_mut() {
            if rows.len() > cap {
                let excess = rows.len() - cap;
                rows.drain(..excess);
                removed += excess as u64;
            }
        }
        Ok(removed)
    }

    async fn trim_node_events(&self, cap: usize) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let mut removed = 0;
        for rows in t.node_events.values_mut() {
            if rows.len() > cap {
                let excess = rows.len() - cap;
                rows.drain(..excess);
                removed += excess as u64;
            }
        }
        Ok(removed)
    }

    async fn insert_group(&self, group: NodeGroup) -> StoreResult<()> {
        self.tables.lock().await.groups.insert(group.id, group);
        Ok(())
    }

    async fn get_group(&self, id: Uuid) -> StoreResult<NodeGroup> {
        self.tables
            .lock()
            .await
            .groups
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("group", id))
    }

    async fn list_groups(&self, project_id: Uuid) -> StoreResult<Vec<NodeGroup>> {
        let t = self.tables.lock().await;
        Ok(t.groups
            .values()
            .filter(|g| g.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_drift_event(&self, event: DriftEvent) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.drift_events
            .values()
            .any(|e| e.node_id == event.node_id && !e.is_resolved())
        {
            return Err(EngineError::invalid_state(
                "node already has an unresolved drift event",
            ));
        }
        t.drift_events.insert(event.id, event);
        Ok(())
    }

    async fn get_drift_event(&self, id: Uuid) -> StoreResult<DriftEvent> {
        self.tables
            .lock()
            .await
            .drift_events
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("drift_event", id))
    }

    async fn active_drift_event(&self, node_id: Uuid) -> StoreResult<Option<DriftEvent>> {
        let t = self.tables.lock().await;
        Ok(t.drift_events
            .values()
            .find(|e| e.node_id == node_id && !e.is_resolved())
            .cloned())
    }

    async fn tag_drift_event(&self, id: Uuid, resolution: DriftResolution) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let event = t
            .drift_events
            .get_mut(&id)
            .ok_or(EngineError::not_found("drift_event", id))?;
        if event.is_resolved() {
            return Err(EngineError::invalid_state("drift event already resolved"));
        }
        event.resolution = Some(resolution);
        Ok(())
    }

    async fn resolve_drift_event(
        &self,
        id: Uuid,
        resolution: DriftResolution,
        at: DateTime<Utc>,
    ) -> StoreResult<DriftEvent> {
        let mut t = self.tables.lock().await;
        let event = t
            .drift_events
            .get_mut(&id)
            .ok_or(EngineError::not_found("drift_event", id))?;
        if event.is_resolved() {
            return Err(EngineError::invalid_state("drift event already resolved"));
        }
        event.resolved_at = Some(at);
        event.resolution = Some(resolution);
        Ok(event.clone())
    }

    async fn list_drift_events(
        &self,
        project_id: Uuid,
        include_resolved: bool,
    ) -> StoreResult<Vec<DriftEvent>> {
        let t = self.tables.lock().await;
        let mut events: Vec<DriftEvent> = t
            .drift_events
            .values()
            .filter(|e| e.project_id == project_id && (include_resolved || !e.is_resolved()))
            .cloned()
            .collect();
        events.sort_by(|a, b| (b.detected_at, b.id).cmp(&(a.detected_at, a.id)));
        Ok(events)
    }

    async fn count_open_drift_events(&self, project_id: Uuid) -> StoreResult<u64> {
        let t = self.tables.lock().await;
        Ok(t.drift_events
            .values()
            .filter(|e| e.project_id == project_id && !e.is_resolved())
            .count() as u64)
    }

    async fn insert_rollout(&self, rollout: Rollout) -> StoreResult<()> {
        self.tables.lock().await.rollouts.insert(rollout.id, rollout);
        Ok(())
    }

    async fn get_rollout(&self, id: Uuid) -> StoreResult<Rollout> {
        self.tables
            .lock()
            .await
            .rollouts
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("rollout", id))
    }

    async fn list_rollouts(&self, project_id: Uuid) -> StoreResult<Vec<Rollout>> {
        let t = self.tables.lock().await;
        let mut rollouts: Vec<Rollout> = t
            .rollouts
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect();
        rollouts.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(rollouts)
    }

    async fn due_scheduled_rollouts(&self, now: DateTime<Utc>) -> StoreResult<Vec<Rollout>> {
        let t = self.tables.lock().await;
        Ok(t.rollouts
            .values()
            .filter(|r| {
                r.state == RolloutState::Pending
                    && r.scheduled_at.is_some_and(|at| at <= now)
                    && r.approval_state.allows_planning()
            })
            .cloned()
            .collect())
    }

    async fn update_rollout_state(
        &self,
        id: Uuid,
        from: RolloutState,
        to: RolloutState,
        fields: RolloutStateFields,
    ) -> StoreResult<Rollout> {
        let mut t = self.tables.lock().await;
        let rollout = t
            .rollouts
            .get_mut(&id)
            .ok_or(EngineError::not_found("rollout", id))?;
        if rollout.state != from {
            return Err(EngineError::invalid_state(format!(
                "rollout is {:?}, expected {:?}",
                rollout.state, from
            )));
        }
        rollout.state = to;
        if fields.started_at.is_some() {
            rollout.started_at = fields.started_at;
        }
        if fields.completed_at.is_some() {
            rollout.completed_at = fields.completed_at;
        }
        if fields.error.is_some() {
            rollout.error = fields.error;
        }
        Ok(rollout.clone())
    }

    async fn set_approval_state(&self, id: Uuid, state: ApprovalState) -> StoreResult<Rollout> {
        let mut t = self.tables.lock().await;
        let rollout = t
            .rollouts
            .get_mut(&id)
            .ok_or(EngineError::not_found("rollout", id))?;
        rollout.approval_state = state;
        Ok(rollout.clone())
    }

    async fn insert_approval(&self, approval: RolloutApproval) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.approvals
            .values()
            .any(|a| a.rollout_id == approval.rollout_id && a.user_id == approval.user_id)
        {
            return Err(EngineError::AlreadyApproved);
        }
        t.approvals.insert(approval.id, approval);
        Ok(())
    }

    async fn count_approvals(&self, rollout_id: Uuid) -> StoreResult<u32> {
        let t = self.tables.lock().await;
        Ok(t.approvals
            .values()
            .filter(|a| a.rollout_id == rollout_id)
            .count() as u32)
    }

    async fn insert_rollout_plan(
        &self,
        rollout_id: Uuid,
        steps: Vec<RolloutStep>,
        statuses: Vec<NodeBundleStatus>,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Rollout> {
        let mut t = self.tables.lock().await;
        let rollout = t
            .rollouts
            .get_mut(&rollout_id)
            .ok_or(EngineError::not_found("rollout", rollout_id))?;
        if rollout.state != RolloutState::Pending {
            return Err(EngineError::invalid_state(format!(
                "cannot plan a {:?} rollout",
                rollout.state
            )));
        }
        rollout.state = RolloutState::Running;
        rollout.started_at = Some(started_at);
        let planned = rollout.clone();
        for step in steps {
            t.steps.insert(step.id, step);
        }
        for status in statuses {
            t.node_statuses.insert(status.id, status);
        }
        Ok(planned)
    }

    async fn list_steps(&self, rollout_id: Uuid) -> StoreResult<Vec<RolloutStep>> {
        let t = self.tables.lock().await;
        let mut steps: Vec<RolloutStep> = t
            .steps
            .values()
            .filter(|s| s.rollout_id == rollout_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn update_step_state(
        &self,
        step_id: Uuid,
        from: StepState,
        to: StepState,
        fields: StepStateFields,
    ) -> StoreResult<RolloutStep> {
        let mut t = self.tables.lock().await;
        let step = t
            .steps
            .get_mut(&step_id)
            .ok_or(EngineError::not_found("rollout_step", step_id))?;
        if step.state != from {
            return Err(EngineError::invalid_state(format!(
                "step is {:?}, expected {:?}",
                step.state, from
            )));
        }
        step.state = to;
        if fields.started_at.is_some() {
            step.started_at = fields.started_at;
        }
        if fields.completed_at.is_some() {
            step.completed_at = fields.completed_at;
        }
        if fields.error.is_some() {
            step.error = fields.error;
        }
        Ok(step.clone())
    }

    async fn list_node_statuses(&self, rollout_id: Uuid) -> StoreResult<Vec<NodeBundleStatus>> {
        let t = self.tables.lock().await;
        Ok(t.node_statuses
            .values()
            .filter(|s| s.rollout_id == rollout_id)
            .cloned()
            .collect())
    }

    async fn advance_node_statuses(
        &self,
        rollout_id: Uuid,
        node_ids: &[Uuid],
        to: NodeProgress,
        stamps: ProgressStamps,
    ) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        for status in t.node_statuses.values_mut() {
            if status.rollout_id != rollout_id || !node_ids.contains(&status.node_id) {
                continue;
            }
            if !status.state.can_advance_to(to) {
                continue;
            }
            status.state = to;
            if stamps.staged_at.is_some() {
                status.staged_at = stamps.staged_at;
            }
            if stamps.activated_at.is_some() {
                status.activated_at = stamps.activated_at;
            }
            if stamps.verified_at.is_some() {
                status.verified_at = stamps.verified_at;
            }
            if stamps.last_report_at.is_some() {
                status.last_report_at = stamps.last_report_at;
            }
        }
        Ok(())
    }

    async fn cancel_rollout_with_reset(
        &self,
        rollout_id: Uuid,
        allowed_from: &[RolloutState],
    ) -> StoreResult<Rollout> {
        let mut t = self.tables.lock().await;
        let rollout = t
            .rollouts
            .get_mut(&rollout_id)
            .ok_or(EngineError::not_found("rollout", rollout_id))?;
        if !allowed_from.contains(&rollout.state) {
            return Err(EngineError::invalid_state(format!(
                "cannot cancel a {:?} rollout",
                rollout.state
            )));
        }
        rollout.state = RolloutState::Cancelled;
        rollout.completed_at = Some(clock::now());
        let bundle_id = rollout.bundle_id;
        let cancelled = rollout.clone();
        for node in t.nodes.values_mut() {
            if node.staged_bundle_id == Some(bundle_id) {
                node.staged_bundle_id = None;
            }
        }
        Ok(cancelled)
    }

    async fn count_nodes_by_status(
        &self,
        project_id: Uuid,
    ) -> StoreResult<BTreeMap<NodeStatus, u64>> {
        let t = self.tables.lock().await;
        let mut counts = BTreeMap::new();
        for node in t.nodes.values().filter(|n| n.project_id == project_id) {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
