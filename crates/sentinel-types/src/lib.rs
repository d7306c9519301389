//! # Types
//!
//! Core domain types for the Sentinel control plane.
//!
//! This crate defines the fundamental data structures shared by every other
//! crate in the workspace:
//! - [`Bundle`] - Immutable, content-addressed configuration artifact
//! - [`Node`] - A managed edge proxy process and its lifecycle fields
//! - [`Rollout`] / [`RolloutStep`] - The batched, health-gated delivery plan
//! - [`DriftEvent`] - Observed-vs-expected divergence for a single node
//! - [`EngineError`] - Structured error kinds surfaced by the engine
//!
//! ## Serialization
//!
//! All entities implement `Serialize` and `Deserialize` from `serde` and are
//! stored and transported as JSON. Enums serialize as `snake_case` strings.
//!
//! ## Identifiers and time
//!
//! Identifiers are 128-bit opaque values ([`uuid::Uuid`]). All timestamps are
//! UTC with second resolution; code that stamps an entity goes through
//! [`clock::now`], which truncates sub-second precision at write time.

pub mod bundle;
pub mod clock;
pub mod drift;
pub mod error;
pub mod node;
pub mod notify;
pub mod rollout;
pub mod tenant;

pub use bundle::{
    Bundle, BundleIn, BundleManifest, BundlePromotion, BundleStatus, ManifestFile, RiskLevel,
    RiskReason, RuleKind, RuleSeverity, SourceType, ValidationRule,
};
pub use clock::now;
pub use drift::{DriftEvent, DriftResolution};
pub use error::EngineError;
pub use node::{
    EventSeverity, HEALTH_STATUS_KEY, Node, NodeEvent, NodeGroup, NodeHeartbeat, NodeStatus,
};
pub use notify::NotificationEvent;
pub use rollout::{
    ApprovalState, HealthCheckEndpoint, HealthGates, NodeBundleStatus, NodeProgress, Rollout,
    RolloutApproval, RolloutError, RolloutState, RolloutStep, RolloutStrategy, StepState,
    TargetSelector,
};
pub use tenant::{ApiKey, Environment, Organization, Project, ProjectSettings, Role, SigningKey, User};

/// Generate a fresh 128-bit opaque identifier.
pub fn new_id() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}
