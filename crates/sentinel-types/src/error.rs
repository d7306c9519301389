//! Structured error kinds surfaced by the engine.
//!
//! Precondition failures (auth, state) are validated synchronously and
//! returned to the caller as one of these variants. Background failures
//! (compile, probe, webhook) are recorded on the artifact they belong to and
//! never surface here.

use thiserror::Error;
use uuid::Uuid;

/// Every error kind the engine returns across its service boundaries.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("invalid state transition: {detail}")]
    InvalidState { detail: String },

    #[error("bundle {0} is not compiled")]
    BundleNotCompiled(Uuid),

    #[error("bundle {0} not found")]
    BundleNotFound(Uuid),

    #[error("target selector resolved to zero nodes")]
    NoTargetNodes,

    #[error("rollout requires approval before planning")]
    ApprovalRequired,

    #[error("rollout creators may not approve their own rollout")]
    SelfApproval,

    #[error("user already approved this rollout")]
    AlreadyApproved,

    #[error("actor is not authorized for this operation")]
    NotAuthorized,

    #[error("a non-empty comment is required")]
    CommentRequired,

    #[error("organization has no usable signing key")]
    NoSigningKey,

    #[error("token claims are invalid: {0}")]
    InvalidClaims(String),

    #[error("signing key {0} is deactivated or expired")]
    KeyDeactivated(Uuid),

    #[error("unknown signing key id")]
    UnknownKey,

    #[error("credential is malformed or does not verify")]
    InvalidKey,

    #[error("unavailable nodes exceed max_unavailable")]
    MaxUnavailableExceeded,

    #[error("step {step_index} exceeded its progress deadline after {elapsed_seconds}s")]
    StepDeadlineExceeded { step_index: u32, elapsed_seconds: i64 },

    #[error("bundle was revoked")]
    BundleRevoked,
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        EngineError::InvalidState { detail: detail.into() }
    }

    /// Stable machine-readable tag for wire surfaces and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::BundleNotCompiled(_) => "bundle_not_compiled",
            EngineError::BundleNotFound(_) => "bundle_not_found",
            EngineError::NoTargetNodes => "no_target_nodes",
            EngineError::ApprovalRequired => "approval_required",
            EngineError::SelfApproval => "self_approval",
            EngineError::AlreadyApproved => "already_approved",
            EngineError::NotAuthorized => "not_authorized",
            EngineError::CommentRequired => "comment_required",
            EngineError::NoSigningKey => "no_signing_key",
            EngineError::InvalidClaims(_) => "invalid_claims",
            EngineError::KeyDeactivated(_) => "key_deactivated",
            EngineError::UnknownKey => "unknown_key",
            EngineError::InvalidKey => "invalid_key",
            EngineError::MaxUnavailableExceeded => "max_unavailable_exceeded",
            EngineError::StepDeadlineExceeded { .. } => "step_deadline_exceeded",
            EngineError::BundleRevoked => "bundle_revoked",
        }
    }
}
