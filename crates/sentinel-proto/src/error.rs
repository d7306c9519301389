//! Error envelope for the node-facing protocol.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use sentinel_types::EngineError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// Protocol-level error: an engine error plus the transport cases the engine
/// never sees (missing credentials, malformed bodies).
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    MissingAuth,
    Validation(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingAuth => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Engine(err) => match err {
                EngineError::NotFound { .. } | EngineError::BundleNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                EngineError::InvalidKey
                | EngineError::UnknownKey
                | EngineError::InvalidClaims(_)
                | EngineError::KeyDeactivated(_) => StatusCode::UNAUTHORIZED,
                EngineError::NotAuthorized => StatusCode::FORBIDDEN,
                EngineError::NoSigningKey => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::NoTargetNodes
                | EngineError::CommentRequired
                | EngineError::SelfApproval => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::InvalidState { .. }
                | EngineError::BundleNotCompiled(_)
                | EngineError::BundleRevoked
                | EngineError::ApprovalRequired
                | EngineError::AlreadyApproved
                | EngineError::MaxUnavailableExceeded
                | EngineError::StepDeadlineExceeded { .. } => StatusCode::CONFLICT,
            },
        }
    }

    fn code(&self) -> String {
        match self {
            ApiError::MissingAuth => "unauthorized".to_string(),
            ApiError::Validation(_) => "validation".to_string(),
            ApiError::Engine(err) => err.kind().to_string(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::MissingAuth => "missing bearer credential".to_string(),
            ApiError::Validation(message) => message.clone(),
            ApiError::Engine(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody { error: self.message(), code: self.code() };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_the_wire_contract() {
        assert_eq!(ApiError::MissingAuth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Engine(EngineError::NotAuthorized).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Engine(EngineError::NoSigningKey).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Engine(EngineError::not_found("node", sentinel_types::new_id())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Engine(EngineError::invalid_state("revoke non-compiled")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Engine(EngineError::InvalidKey).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn code_is_the_stable_engine_tag() {
        assert_eq!(ApiError::Engine(EngineError::NoSigningKey).code(), "no_signing_key");
        assert_eq!(ApiError::MissingAuth.code(), "unauthorized");
    }
}
