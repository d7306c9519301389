//! Health-gate evaluation and custom endpoint probes.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use sentinel_types::{HealthCheckEndpoint, HealthGates, NodeHeartbeat};

/// Probes a custom health endpoint during step verification.
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, endpoint: &HealthCheckEndpoint) -> bool;
}

/// HTTP prober with a bounded timeout; any transport error fails the probe.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, endpoint: &HealthCheckEndpoint) -> bool {
        match self.client.get(&endpoint.url).send().await {
            Ok(response) => response.status().as_u16() == endpoint.expect_status,
            Err(err) => {
                debug!(endpoint = %endpoint.name, error = %err, "health probe failed");
                false
            }
        }
    }
}

/// Evaluate the configured gates against a node's latest heartbeat.
///
/// Missing metrics count as zero, matching the reporting defaults of nodes
/// that have nothing to say; a missing heartbeat therefore passes every
/// metric ceiling but can never satisfy `heartbeat_healthy`.
pub fn evaluate_gates(gates: &HealthGates, heartbeat: Option<&NodeHeartbeat>) -> bool {
    if gates.is_empty() {
        return true;
    }
    if gates.heartbeat_healthy == Some(true)
        && heartbeat.and_then(|hb| hb.health_status()) != Some("healthy")
    {
        return false;
    }
    let metric = |key: &str| heartbeat.and_then(|hb| hb.metric(key)).unwrap_or(0.0);
    if gates.max_error_rate.is_some_and(|max| metric("error_rate") > max) {
        return false;
    }
    if gates.max_latency_ms.is_some_and(|max| metric("latency_p99_ms") > max) {
        return false;
    }
    if gates.max_cpu_percent.is_some_and(|max| metric("cpu_percent") > max) {
        return false;
    }
    if gates.max_memory_percent.is_some_and(|max| metric("memory_percent") > max) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use serde_json::json;

    fn heartbeat(status: Option<&str>, metrics: &[(&str, f64)]) -> NodeHeartbeat {
        let mut health = BTreeMap::new();
        if let Some(status) = status {
            health.insert("status".to_string(), json!(status));
        }
        NodeHeartbeat {
            id: sentinel_types::new_id(),
            node_id: sentinel_types::new_id(),
            health,
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            active_bundle_id: None,
            staged_bundle_id: None,
            version: None,
            inserted_at: sentinel_types::clock::now(),
        }
    }

    #[test]
    fn empty_gates_always_pass() {
        assert!(evaluate_gates(&HealthGates::default(), None));
    }

    #[test]
    fn heartbeat_healthy_requires_the_exact_status() {
        let gates = HealthGates { heartbeat_healthy: Some(true), ..Default::default() };
        assert!(evaluate_gates(&gates, Some(&heartbeat(Some("healthy"), &[]))));
        assert!(!evaluate_gates(&gates, Some(&heartbeat(Some("degraded"), &[]))));
        assert!(!evaluate_gates(&gates, Some(&heartbeat(None, &[]))));
        assert!(!evaluate_gates(&gates, None));
    }

    #[test]
    fn metric_ceilings_are_inclusive() {
        let gates = HealthGates { max_error_rate: Some(0.05), ..Default::default() };
        assert!(evaluate_gates(&gates, Some(&heartbeat(None, &[("error_rate", 0.05)]))));
        assert!(!evaluate_gates(&gates, Some(&heartbeat(None, &[("error_rate", 0.06)]))));
    }

    #[test]
    fn missing_metrics_count_as_zero() {
        let gates = HealthGates {
            max_error_rate: Some(0.01),
            max_latency_ms: Some(250.0),
            max_cpu_percent: Some(80.0),
            max_memory_percent: Some(90.0),
            ..Default::default()
        };
        assert!(evaluate_gates(&gates, Some(&heartbeat(None, &[]))));
        assert!(evaluate_gates(&gates, None));
    }

    #[test]
    fn any_breached_ceiling_fails() {
        let gates = HealthGates {
            heartbeat_healthy: Some(true),
            max_cpu_percent: Some(80.0),
            ..Default::default()
        };
        let hb = heartbeat(Some("healthy"), &[("cpu_percent", 95.0)]);
        assert!(!evaluate_gates(&gates, Some(&hb)));
    }
}
