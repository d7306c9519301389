//! The composition root: one [`Server`] value owns every sub-service,
//! started in dependency order and stopped through a single propagating
//! cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sentinel_bundle::{BundleConfig, BundleService, ConfigValidator, FsObjectStore, ObjectStore, RuleValidator};
use sentinel_dispatch::{CronJob, DispatchConfig, Dispatcher, Job, JobQueue};
use sentinel_drift::{DriftConfig, DriftEngine};
use sentinel_identity::{IdentityService, TokenConfig, generate_signing_key};
use sentinel_nodes::{NodeRegistry, RegistryConfig};
use sentinel_proto::ProtoState;
use sentinel_rollout::{HttpProber, RolloutConfig, RolloutEngine};
use sentinel_store::{MemoryStore, Store, StoreConfig};
use sentinel_types::{Organization, Project, ProjectSettings, clock};

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::handler::{EngineJobHandler, EngineServices};

/// A running control plane.
pub struct Server {
    store: Arc<dyn Store>,
    identity: IdentityService,
    bundles: BundleService,
    rollouts: RolloutEngine,
    drift: Arc<DriftEngine>,
    registry: Arc<NodeRegistry>,
    broadcaster: Arc<Broadcaster>,
    queue: JobQueue,
    dispatcher: Dispatcher,
    http: JoinHandle<()>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Server {
    /// Build and start everything: store, dispatcher, services, protocol
    /// listener, and the cron schedule.
    pub async fn start(config: Config) -> Result<Server> {
        let cancel = CancellationToken::new();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(StoreConfig {
            heartbeat_cap: config.store.heartbeat_cap,
            node_event_cap: config.store.node_event_cap,
        }));

        // The dispatcher comes up first so the services can hold its queue;
        // its handler learns about the services right below.
        let handler = Arc::new(EngineJobHandler::default());
        let crons = vec![
            CronJob { period: config.registry.sweep_interval, job: Job::LivenessSweep },
            CronJob { period: config.drift.scan_interval, job: Job::DriftScan },
            CronJob {
                period: config.rollouts.scheduled_scan_interval,
                job: Job::ScheduledRolloutScan,
            },
            CronJob { period: config.cleanup.interval, job: Job::HeartbeatCleanup },
            CronJob { period: config.cleanup.interval, job: Job::EventCleanup },
        ];
        let dispatcher = Dispatcher::start(
            Arc::clone(&handler) as Arc<dyn sentinel_dispatch::JobHandler>,
            DispatchConfig {
                workers: config.dispatcher.workers,
                queue_capacity: config.dispatcher.queue_capacity,
                ..Default::default()
            },
            crons,
            cancel.clone(),
        );
        let queue = dispatcher.queue();

        let identity = IdentityService::new(
            Arc::clone(&store),
            TokenConfig {
                node_token_ttl_seconds: config.identity.node_token_ttl.as_secs() as i64,
            },
        );
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
            config.bundles.storage_dir.clone(),
            config.bundles.artifact_base_url.clone(),
            config.bundles.presign_secret.clone(),
        ));
        let validator: Arc<dyn ConfigValidator> = Arc::new(RuleValidator::new(Arc::clone(&store)));
        let bundles = BundleService::new(
            Arc::clone(&store),
            objects,
            validator,
            identity.clone(),
            queue.clone(),
            BundleConfig {
                sign_bundles: config.bundles.sign_bundles,
                compression: config.bundles.compression,
                presign_ttl: config.bundles.presign_ttl,
            },
        );
        let rollouts = RolloutEngine::new(
            Arc::clone(&store),
            queue.clone(),
            Arc::new(HttpProber::new(config.rollouts.probe_timeout)),
            RolloutConfig {
                tick_delay: config.rollouts.tick_delay,
                strict_required_counts_offline: config.rollouts.strict_required_counts_offline,
            },
        );
        let drift = Arc::new(DriftEngine::new(
            Arc::clone(&store),
            rollouts.clone(),
            queue.clone(),
            DriftConfig {
                remediation_interval: config.drift.remediation_interval,
                open_event_threshold: config.drift.open_event_threshold,
            },
        ));
        let registry = Arc::new(NodeRegistry::new(
            Arc::clone(&store),
            Arc::clone(&drift),
            RegistryConfig {
                poll_interval: config.registry.poll_interval,
                stale_threshold: config.registry.stale_threshold,
                heartbeat_cap: config.store.heartbeat_cap,
                node_event_cap: config.store.node_event_cap,
            },
        ));
        let broadcaster = Arc::new(Broadcaster::default());
        handler.install(EngineServices {
            bundles: bundles.clone(),
            rollouts: rollouts.clone(),
            drift: Arc::clone(&drift),
            registry: Arc::clone(&registry),
            endpoints: config.webhooks.endpoints.clone(),
            broadcaster: Arc::clone(&broadcaster),
        });

        if let Some(bootstrap) = &config.bootstrap {
            bootstrap_tenants(&store, bootstrap).await?;
        }

        let app = sentinel_proto::router(ProtoState {
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            bundles: bundles.clone(),
            identity: identity.clone(),
        });
        let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
        let local_addr = listener.local_addr().context("failed to read local addr")?;
        let shutdown = cancel.clone();
        let http = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(err) = serve.await {
                tracing::error!(error = %err, "protocol listener exited");
            }
        });
        info!(addr = %local_addr, "control plane listening");

        Ok(Server {
            store,
            identity,
            bundles,
            rollouts,
            drift,
            registry,
            broadcaster,
            queue,
            dispatcher,
            http,
            local_addr,
            cancel,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    pub fn bundles(&self) -> &BundleService {
        &self.bundles
    }

    pub fn rollouts(&self) -> &RolloutEngine {
        &self.rollouts
    }

    pub fn drift(&self) -> &Arc<DriftEngine> {
        &self.drift
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until interrupted, then stop everything.
    pub async fn run_until_shutdown(self) -> Result<()> {
        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        info!("shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Stop in reverse dependency order: listener first, then the
    /// dispatcher and its workers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.http.await;
        self.dispatcher.shutdown().await;
        info!("control plane stopped");
    }
}

async fn bootstrap_tenants(
    store: &Arc<dyn Store>,
    bootstrap: &crate::config::BootstrapSection,
) -> Result<()> {
    if !store.list_projects().await?.is_empty() {
        return Ok(());
    }
    let org = Organization {
        id: sentinel_types::new_id(),
        name: bootstrap.organization.clone(),
        created_at: clock::now(),
    };
    store.insert_organization(org.clone()).await?;
    for slug in &bootstrap.projects {
        store
            .insert_project(Project {
                id: sentinel_types::new_id(),
                org_id: org.id,
                name: slug.clone(),
                slug: slug.clone(),
                settings: ProjectSettings::default(),
                created_at: clock::now(),
            })
            .await?;
    }
    if bootstrap.generate_signing_key {
        store.insert_signing_key(generate_signing_key(org.id, None)).await?;
    }
    info!(org = %org.name, projects = bootstrap.projects.len(), "bootstrapped tenant tree");
    Ok(())
}
