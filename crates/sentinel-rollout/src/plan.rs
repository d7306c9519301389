//! Planning: resolve the target node set, filter it, and chunk it into
//! ordered batches.

use std::sync::Arc;

use uuid::Uuid;

use sentinel_store::{Store, StoreResult};
use sentinel_types::{Node, RolloutStrategy, TargetSelector};

/// Resolve a selector to concrete nodes in deterministic order: registration
/// order for `All`/`Labels`, given order for explicit ids, group order then
/// member order for groups. Unknown ids are silently dropped.
pub async fn resolve_targets(
    store: &Arc<dyn Store>,
    project_id: Uuid,
    selector: &TargetSelector,
) -> StoreResult<Vec<Node>> {
    match selector {
        TargetSelector::All => store.list_nodes(project_id).await,
        TargetSelector::Labels { labels } => store.nodes_by_labels(project_id, labels).await,
        TargetSelector::NodeIds { node_ids } => store.nodes_by_ids(project_id, node_ids).await,
        TargetSelector::GroupIds { group_ids } => {
            let mut member_ids: Vec<Uuid> = Vec::new();
            for group_id in group_ids {
                let Ok(group) = store.get_group(*group_id).await else {
                    continue;
                };
                if group.project_id != project_id {
                    continue;
                }
                for node_id in group.node_ids {
                    if !member_ids.contains(&node_id) {
                        member_ids.push(node_id);
                    }
                }
            }
            store.nodes_by_ids(project_id, &member_ids).await
        }
    }
}

/// Keep nodes whose semver window admits the bundle version. Unparseable
/// bounds are ignored for that node; an unparseable bundle version disables
/// the filter entirely.
pub fn filter_version_window(nodes: Vec<Node>, bundle_version: &str) -> Vec<Node> {
    let Ok(version) = semver::Version::parse(bundle_version) else {
        return nodes;
    };
    nodes
        .into_iter()
        .filter(|node| {
            let min_ok = node
                .min_bundle_version
                .as_deref()
                .and_then(|v| semver::Version::parse(v).ok())
                .is_none_or(|min| version >= min);
            let max_ok = node
                .max_bundle_version
                .as_deref()
                .and_then(|v| semver::Version::parse(v).ok())
                .is_none_or(|max| version <= max);
            min_ok && max_ok
        })
        .collect()
}

/// Chunk resolved ids into batches, preserving resolution order.
pub fn chunk_batches(
    node_ids: &[Uuid],
    strategy: RolloutStrategy,
    batch_size: u32,
    batch_percentage: Option<u32>,
) -> Vec<Vec<Uuid>> {
    if node_ids.is_empty() {
        return Vec::new();
    }
    let batch = match strategy {
        RolloutStrategy::AllAtOnce => node_ids.len(),
        RolloutStrategy::Rolling => match batch_percentage {
            Some(pct) if pct > 0 => {
                (node_ids.len() * pct.min(100) as usize / 100).max(1)
            }
            _ => (batch_size as usize).max(1),
        },
    };
    node_ids.chunks(batch).map(|chunk| chunk.to_vec()).collect()
}
