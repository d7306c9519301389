//! Job-handler wiring: maps dispatcher jobs onto the services.
//!
//! The handler is installed after the services are built (they need the
//! dispatcher's queue to exist first); a job delivered in the window before
//! installation errors and is retried by the dispatcher.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::debug;

use sentinel_bundle::BundleService;
use sentinel_dispatch::{Job, JobHandler};
use sentinel_drift::DriftEngine;
use sentinel_nodes::NodeRegistry;
use sentinel_rollout::RolloutEngine;
use sentinel_types::NotificationEvent;
use sentinel_webhook::{WebhookEndpoint, send_notification};

use crate::broadcast::Broadcaster;

pub struct EngineServices {
    pub bundles: BundleService,
    pub rollouts: RolloutEngine,
    pub drift: Arc<DriftEngine>,
    pub registry: Arc<NodeRegistry>,
    pub endpoints: Vec<WebhookEndpoint>,
    pub broadcaster: Arc<Broadcaster>,
}

#[derive(Default)]
pub struct EngineJobHandler {
    services: OnceLock<EngineServices>,
}

impl EngineJobHandler {
    pub fn install(&self, services: EngineServices) {
        if self.services.set(services).is_err() {
            debug!("job handler services were already installed");
        }
    }

    fn services(&self) -> anyhow::Result<&EngineServices> {
        self.services
            .get()
            .ok_or_else(|| anyhow::anyhow!("engine services not yet installed"))
    }

    async fn deliver(&self, services: &EngineServices, event: NotificationEvent) -> anyhow::Result<()> {
        services
            .broadcaster
            .publish(event.topic(), serde_json::to_value(&event)?);
        let mut failures = 0;
        for endpoint in &services.endpoints {
            if let Err(err) = send_notification(endpoint, &event).await {
                tracing::warn!(url = %endpoint.url, error = %err, "webhook delivery failed");
                failures += 1;
            }
        }
        if failures > 0 {
            anyhow::bail!("{failures} webhook deliveries failed");
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EngineJobHandler {
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        let services = self.services()?;
        match job {
            Job::CompileBundle { bundle_id } => {
                services.bundles.compile(bundle_id).await?;
            }
            Job::TickRollout { rollout_id } => {
                services.rollouts.tick(rollout_id).await?;
            }
            Job::LivenessSweep => {
                services.registry.liveness_sweep().await?;
            }
            Job::DriftScan => {
                services.drift.scan().await?;
            }
            Job::ScheduledRolloutScan => {
                services.rollouts.plan_due_scheduled().await?;
            }
            Job::DeliverWebhook { event } => {
                self.deliver(services, event).await?;
            }
            Job::HeartbeatCleanup => {
                services.registry.cleanup_heartbeats().await?;
            }
            Job::EventCleanup => {
                services.registry.cleanup_events().await?;
            }
        }
        Ok(())
    }
}
