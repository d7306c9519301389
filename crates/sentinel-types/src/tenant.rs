//! Tenant tree: organizations, projects, environments, and the identity
//! records that hang off them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top of the tenant tree. Signing keys are scoped to an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A project owns bundles, nodes, and rollouts. Belongs to one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    /// URL-safe identifier used by the node-facing protocol.
    pub slug: String,
    #[serde(default)]
    pub settings: ProjectSettings,
    pub created_at: DateTime<Utc>,
}

/// Per-project policy knobs consulted by the rollout and drift engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// When true, new rollouts start in `pending_approval`.
    #[serde(default)]
    pub require_approval: bool,
    /// Approvals needed before a rollout may be planned.
    #[serde(default = "default_approvals_needed")]
    pub approvals_needed: u32,
    /// When true, an opened drift event immediately enqueues a single-node
    /// remediation rollout back to the expected bundle.
    #[serde(default)]
    pub drift_auto_remediation: bool,
}

fn default_approvals_needed() -> u32 {
    1
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            require_approval: false,
            approvals_needed: default_approvals_needed(),
            drift_auto_remediation: false,
        }
    }
}

/// A promotion target within a project. `ordinal` defines a total promotion
/// order: a bundle reaches ordinal `n` only after every ordinal below it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub ordinal: i32,
}

/// Role held by a user within an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Viewer,
    Operator,
    Admin,
}

impl Role {
    /// Whether this role may approve or reject rollouts.
    pub fn can_approve(self) -> bool {
        self >= Role::Operator
    }
}

/// Minimal actor record. Full user management lives outside the core; this
/// exists so approvals can be attributed and authorized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub role: Role,
}

/// Per-organization Ed25519 keypair used for node tokens and bundle
/// signatures. The most recent active, non-expired key signs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKey {
    /// Key identifier; carried as `kid` in token headers.
    pub id: Uuid,
    pub org_id: Uuid,
    /// Ed25519 verifying key, base64url.
    pub public_key: String,
    /// Ed25519 seed, base64url. At-rest protection is the store's concern.
    pub private_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SigningKey {
    /// Whether this key may sign or verify at `at`.
    pub fn usable_at(&self, at: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|exp| at < exp)
    }
}

/// Operator API key. The raw secret is never stored; only its SHA-256 hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Active iff not revoked and not expired.
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|exp| at < exp)
    }
}
