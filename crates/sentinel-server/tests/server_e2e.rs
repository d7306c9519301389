//! Full-loop test: a node registers over HTTP, a bundle compiles through the
//! dispatcher, a rollout plans and ticks itself to completion while the node
//! heartbeats, and the broadcaster reports the state changes.

use std::time::Duration;

use serde_json::{Value, json};

use sentinel_rollout::RolloutIn;
use sentinel_server::{Config, Server};
use sentinel_server::config::BootstrapSection;
use sentinel_types::{
    BundleIn, BundleStatus, HealthGates, RolloutState, RolloutStrategy, TargetSelector,
};

async fn start_server() -> (tempfile::TempDir, Server) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().expect("addr");
    config.bundles.storage_dir = dir.path().join("bundles");
    config.rollouts.tick_delay = Duration::from_millis(50);
    config.bootstrap = Some(BootstrapSection {
        organization: "acme".into(),
        projects: vec!["edge".into()],
        generate_signing_key: true,
    });
    let server = Server::start(config).await.expect("server start");
    (dir, server)
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_registration_compile_and_rollout_complete_end_to_end() {
    let (_dir, server) = start_server().await;
    let base = format!("http://{}", server.local_addr());
    let client = reqwest::Client::new();

    // Node registers over the wire and receives its one-time key.
    let registered: Value = client
        .post(format!("{base}/api/v1/projects/edge/nodes/register"))
        .json(&json!({ "name": "edge-1", "labels": { "region": "eu" } }))
        .send()
        .await
        .expect("register request")
        .json()
        .await
        .expect("register body");
    let node_id: uuid::Uuid = registered["node_id"]
        .as_str()
        .expect("node_id")
        .parse()
        .expect("uuid");
    let node_key = registered["node_key"].as_str().expect("node_key").to_string();

    // A bundle compiles through the dispatcher without further prodding.
    let project = server
        .store()
        .get_project_by_slug("edge")
        .await
        .expect("project");
    let bundle = server
        .bundles()
        .create_bundle(BundleIn {
            project_id: project.id,
            version: "1.0.0".into(),
            config_source: "listener \"web\" { port 8080 }".into(),
            source_type: Default::default(),
            source_ref: None,
        })
        .await
        .expect("create bundle");
    wait_for("bundle compile", || async {
        server
            .store()
            .get_bundle(bundle.id)
            .await
            .is_ok_and(|b| b.status == BundleStatus::Compiled)
    })
    .await;

    // Watch for the terminal state change on the broadcaster.
    let mut state_changes = server.broadcaster().subscribe("rollout.state_changed");

    let rollout = server
        .rollouts()
        .create_rollout(RolloutIn {
            project_id: project.id,
            bundle_id: bundle.id,
            target_selector: TargetSelector::All,
            strategy: RolloutStrategy::Rolling,
            batch_size: 1,
            batch_percentage: None,
            max_unavailable: 0,
            progress_deadline_seconds: 60,
            health_gates: HealthGates { heartbeat_healthy: Some(true), ..Default::default() },
            custom_health_checks: vec![],
            auto_rollback: false,
            scheduled_at: None,
            created_by_id: sentinel_types::new_id(),
        })
        .await
        .expect("create rollout");
    server.rollouts().plan_rollout(rollout.id).await.expect("plan");

    // The self-arming ticker stages the bundle on the node.
    wait_for("bundle staged on node", || async {
        server
            .store()
            .get_node(node_id)
            .await
            .is_ok_and(|n| n.staged_bundle_id == Some(bundle.id))
    })
    .await;

    // The node polls its assignment, activates it, and reports healthy.
    let poll: Value = client
        .get(format!("{base}/api/v1/nodes/{node_id}/bundles/latest"))
        .bearer_auth(&node_key)
        .send()
        .await
        .expect("poll request")
        .json()
        .await
        .expect("poll body");
    assert_eq!(poll["bundle_id"], bundle.id.to_string());
    assert!(poll["download_url"].as_str().expect("url").contains("sig="));

    let heartbeat = client
        .post(format!("{base}/api/v1/nodes/{node_id}/heartbeat"))
        .bearer_auth(&node_key)
        .json(&json!({
            "health": { "status": "healthy" },
            "active_bundle_id": bundle.id,
        }))
        .send()
        .await
        .expect("heartbeat request");
    assert!(heartbeat.status().is_success());

    wait_for("rollout completion", || async {
        server
            .store()
            .get_rollout(rollout.id)
            .await
            .is_ok_and(|r| r.state == RolloutState::Completed)
    })
    .await;

    let node = server.store().get_node(node_id).await.expect("node");
    assert_eq!(node.expected_bundle_id, Some(bundle.id));

    // The broadcaster saw the rollout reach its terminal state.
    let mut saw_completed = false;
    while let Ok(event) = state_changes.try_recv() {
        if event["to"] == "completed" {
            saw_completed = true;
        }
    }
    assert!(saw_completed, "no completed state change observed");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_clean_and_releases_the_listener() {
    let (_dir, server) = start_server().await;
    let addr = server.local_addr();
    server.shutdown().await;

    // The port is free again.
    let rebind = tokio::net::TcpListener::bind(addr).await;
    assert!(rebind.is_ok(), "listener port was not released");
}
