//! Server configuration.
//!
//! Loaded from a TOML file and threaded through constructors; no component
//! reads configuration globally. Durations accept human-readable forms
//! (`"30s"`, `"15m"`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use sentinel_bundle::Compression;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub store: StoreSection,
    pub dispatcher: DispatcherSection,
    pub registry: RegistrySection,
    pub bundles: BundlesSection,
    pub rollouts: RolloutsSection,
    pub drift: DriftSection,
    pub identity: IdentitySection,
    pub webhooks: WebhooksSection,
    pub cleanup: CleanupSection,
    pub bootstrap: Option<BootstrapSection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            store: StoreSection::default(),
            dispatcher: DispatcherSection::default(),
            registry: RegistrySection::default(),
            bundles: BundlesSection::default(),
            rollouts: RolloutsSection::default(),
            drift: DriftSection::default(),
            identity: IdentitySection::default(),
            webhooks: WebhooksSection::default(),
            cleanup: CleanupSection::default(),
            bootstrap: None,
        }
    }
}

impl Config {
    /// Load from a TOML file. `SENTINEL_BIND` overrides the bind address.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        if let Ok(bind) = std::env::var("SENTINEL_BIND") {
            config.server.bind_addr = bind
                .parse()
                .with_context(|| format!("invalid SENTINEL_BIND address {bind}"))?;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:8444".parse().expect("default bind addr") }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub heartbeat_cap: usize,
    pub node_event_cap: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self { heartbeat_cap: 100, node_event_cap: 500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self { workers: 4, queue_capacity: 1024 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stale_threshold: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundlesSection {
    /// Root directory of the filesystem object store.
    pub storage_dir: PathBuf,
    /// Public base URL baked into presigned references.
    pub artifact_base_url: String,
    pub presign_secret: String,
    #[serde(with = "humantime_serde")]
    pub presign_ttl: Duration,
    pub sign_bundles: bool,
    pub compression: Compression,
}

impl Default for BundlesSection {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data/bundles"),
            artifact_base_url: "http://127.0.0.1:8444/artifacts".to_string(),
            presign_secret: "change-me".to_string(),
            presign_ttl: Duration::from_secs(300),
            sign_bundles: false,
            compression: Compression::Zstd,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RolloutsSection {
    #[serde(with = "humantime_serde")]
    pub tick_delay: Duration,
    pub strict_required_counts_offline: bool,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub scheduled_scan_interval: Duration,
}

impl Default for RolloutsSection {
    fn default() -> Self {
        Self {
            tick_delay: Duration::from_secs(1),
            strict_required_counts_offline: true,
            probe_timeout: Duration::from_secs(10),
            scheduled_scan_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriftSection {
    #[serde(with = "humantime_serde")]
    pub remediation_interval: Duration,
    pub open_event_threshold: u64,
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
}

impl Default for DriftSection {
    fn default() -> Self {
        Self {
            remediation_interval: Duration::from_secs(900),
            open_event_threshold: 10,
            scan_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    #[serde(with = "humantime_serde")]
    pub node_token_ttl: Duration,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self { node_token_ttl: Duration::from_secs(3600) }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhooksSection {
    pub endpoints: Vec<sentinel_webhook::WebhookEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupSection {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self { interval: Duration::from_secs(600) }
    }
}

/// Optional first-run seeding: one organization, its projects, and a signing
/// key, so a fresh server can take registrations immediately.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapSection {
    pub organization: String,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub generate_signing_key: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").expect("parse");
        assert_eq!(config.dispatcher.workers, 4);
        assert_eq!(config.registry.stale_threshold, Duration::from_secs(120));
        assert_eq!(config.rollouts.tick_delay, Duration::from_secs(1));
        assert!(config.bootstrap.is_none());
        assert!(config.webhooks.endpoints.is_empty());
    }

    #[test]
    fn sections_parse_with_human_durations() {
        let raw = r#"
            [server]
            bind_addr = "0.0.0.0:9000"

            [registry]
            poll_interval = "15s"
            stale_threshold = "2m"
            sweep_interval = "45s"

            [bundles]
            storage_dir = "/var/lib/sentinel/bundles"
            compression = "gzip"
            sign_bundles = true

            [drift]
            remediation_interval = "15m"

            [bootstrap]
            organization = "acme"
            projects = ["edge", "internal"]
            generate_signing_key = true

            [[webhooks.endpoints]]
            url = "https://ops.example.com/hooks"
            secret = "hunter2"
        "#;
        let config: Config = toml::from_str(raw).expect("parse");
        assert_eq!(config.server.bind_addr.port(), 9000);
        assert_eq!(config.registry.poll_interval, Duration::from_secs(15));
        assert_eq!(config.registry.stale_threshold, Duration::from_secs(120));
        assert_eq!(config.bundles.compression, Compression::Gzip);
        assert!(config.bundles.sign_bundles);
        assert_eq!(config.drift.remediation_interval, Duration::from_secs(900));
        let bootstrap = config.bootstrap.expect("bootstrap");
        assert_eq!(bootstrap.projects, vec!["edge", "internal"]);
        assert_eq!(config.webhooks.endpoints.len(), 1);
        assert_eq!(config.webhooks.endpoints[0].secret.as_deref(), Some("hunter2"));
    }
}
