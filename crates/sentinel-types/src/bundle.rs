//! Bundle artifacts: immutable, content-addressed configuration archives and
//! their compile-time metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a bundle.
///
/// Created `pending`, claimed into `compiling` by exactly one worker, then
/// finished one-way into `compiled` or `failed`. A `compiled` bundle may be
/// `revoked` (terminal for distribution) or marked `superseded` by a newer
/// compiled bundle in the same project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    #[default]
    Pending,
    Compiling,
    Compiled,
    Failed,
    Revoked,
    Superseded,
}

impl BundleStatus {
    /// Only never-compiled bundles may be deleted.
    pub fn is_deletable(self) -> bool {
        matches!(self, BundleStatus::Pending | BundleStatus::Failed)
    }

    /// Whether nodes may be pointed at this bundle.
    pub fn is_distributable(self) -> bool {
        self == BundleStatus::Compiled
    }
}

/// How the configuration source reached the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Api,
    Git,
}

/// Compile-time risk assessment relative to the previous compiled bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Machine-readable reasons attached to a risk assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    AuthBlockChanged,
    TlsBlockChanged,
    RouteChurn,
    UpstreamRemoved,
    RateLimitChanged,
}

/// One file inside a bundle archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    /// SHA-256 hex of the file contents.
    pub checksum: String,
    pub size: u64,
}

/// `manifest.json` as shipped inside the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub bundle_id: Uuid,
    pub assembled_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

/// Immutable content-addressed configuration artifact.
///
/// Once `compiled`, the derived fields (`checksum`, `size_bytes`,
/// `storage_key`, `manifest`) are non-null and never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Unique per project.
    pub version: String,
    pub status: BundleStatus,
    /// SHA-256 hex of the outer archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Object-store key, `bundles/{project_id}/{bundle_id}.tar.zst`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    /// Raw KDL text as authored.
    pub config_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<BundleManifest>,
    /// Validator/compiler output captured on both success and failure paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiler_output: Option<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub risk_reasons: Vec<RiskReason>,
    /// Ed25519 over the checksum bytes, base64url. Present only when the
    /// project's organization signs bundles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key_id: Option<Uuid>,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    /// CycloneDX document, generated at compile time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sbom: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bundle {
    /// A fresh `pending` bundle with no derived fields.
    pub fn new(project_id: Uuid, version: impl Into<String>, config_source: impl Into<String>) -> Self {
        let now = crate::clock::now();
        Self {
            id: crate::new_id(),
            project_id,
            version: version.into(),
            status: BundleStatus::Pending,
            checksum: None,
            size_bytes: None,
            storage_key: None,
            config_source: config_source.into(),
            manifest: None,
            compiler_output: None,
            risk_level: RiskLevel::Low,
            risk_reasons: Vec::new(),
            signature: None,
            signing_key_id: None,
            source_type: SourceType::Api,
            source_ref: None,
            sbom: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for creating a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleIn {
    pub project_id: Uuid,
    pub version: String,
    pub config_source: String,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

/// Records that a bundle has been blessed for an environment.
/// `(bundle_id, environment_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlePromotion {
    pub id: Uuid,
    pub bundle_id: Uuid,
    pub environment_id: Uuid,
    pub promoted_at: DateTime<Utc>,
    pub promoted_by: Uuid,
}

/// Severity attached to a validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    #[default]
    Error,
    Warning,
    Info,
}

/// Kind of a per-project validation rule, applied at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    /// The named top-level field/node must be present in the source.
    RequiredField { field: String },
    /// The source must not match this pattern.
    ForbiddenPattern { pattern: String },
    /// Every line matching `applies_to` must also match `pattern`.
    AllowedPattern { applies_to: String, pattern: String },
    /// The source must not exceed this many bytes.
    MaxSize { max_bytes: u64 },
    /// Structured metadata embedded in the source must satisfy this schema.
    JsonSchema { schema: serde_json::Value },
}

/// Per-project compile-time validation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    #[serde(default)]
    pub severity: RuleSeverity,
    #[serde(default)]
    pub enabled: bool,
}

/// Free-form labels used across entities.
pub type Labels = BTreeMap<String, String>;
