//! Node bearer tokens: compact JWS over Ed25519.
//!
//! Layout is the standard three-segment form,
//! `base64url(header).base64url(claims).base64url(signature)`, with header
//! `{alg: "EdDSA", typ: "JWT", kid}`. Verification resolves the org key by
//! `kid` and rejects inactive or expired keys before checking the signature.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sentinel_types::{EngineError, SigningKey, clock};

use crate::keys;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    kid: Uuid,
}

/// Claims carried by a node token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Node id.
    pub sub: Uuid,
    /// Project id.
    pub prj: Uuid,
    /// Organization id.
    pub org: Uuid,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Sign claims into a compact token under `key`.
pub fn issue(key: &SigningKey, claims: &TokenClaims) -> Result<String, EngineError> {
    let header = Header { alg: "EdDSA".into(), typ: "JWT".into(), kid: key.id };
    let header_b64 = B64.encode(serde_json::to_vec(&header).map_err(|_| EngineError::InvalidKey)?);
    let claims_b64 = B64.encode(serde_json::to_vec(claims).map_err(|_| EngineError::InvalidKey)?);
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = keys::sign(key, signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{signature}"))
}

/// Pull the `kid` out of an unverified token so the key can be resolved.
pub fn peek_kid(token: &str) -> Result<Uuid, EngineError> {
    let header_b64 = token.split('.').next().ok_or(EngineError::InvalidKey)?;
    let raw = B64.decode(header_b64).map_err(|_| EngineError::InvalidKey)?;
    let header: Header = serde_json::from_slice(&raw).map_err(|_| EngineError::InvalidKey)?;
    if header.alg != "EdDSA" {
        return Err(EngineError::InvalidKey);
    }
    Ok(header.kid)
}

/// Verify a token against its resolved key and return the claims.
///
/// The caller has already established that `key.id` matches the token's
/// `kid`; this checks key usability, the signature, and the expiry window.
pub fn verify(key: &SigningKey, token: &str, at: DateTime<Utc>) -> Result<TokenClaims, EngineError> {
    if !key.usable_at(at) {
        return Err(EngineError::KeyDeactivated(key.id));
    }
    let mut segments = token.split('.');
    let (header_b64, claims_b64, signature) = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(h), Some(c), Some(s), None) => (h, c, s),
        _ => return Err(EngineError::InvalidKey),
    };
    let signing_input = format!("{header_b64}.{claims_b64}");
    if !keys::verify(key, signing_input.as_bytes(), signature)? {
        return Err(EngineError::InvalidKey);
    }
    let raw = B64.decode(claims_b64).map_err(|_| EngineError::InvalidKey)?;
    let claims: TokenClaims = serde_json::from_slice(&raw)
        .map_err(|e| EngineError::InvalidClaims(e.to_string()))?;
    if claims.exp <= at.timestamp() {
        return Err(EngineError::InvalidClaims("token expired".into()));
    }
    if claims.iat > at.timestamp() + CLOCK_SKEW_SECONDS {
        return Err(EngineError::InvalidClaims("token issued in the future".into()));
    }
    Ok(claims)
}

const CLOCK_SKEW_SECONDS: i64 = 30;

/// Build claims for a node with the given lifetime.
pub fn claims_for(node_id: Uuid, project_id: Uuid, org_id: Uuid, ttl_seconds: i64) -> TokenClaims {
    let now = clock::now().timestamp();
    TokenClaims { sub: node_id, prj: project_id, org: org_id, iat: now, exp: now + ttl_seconds }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_signing_key;

    fn claims(ttl: i64) -> TokenClaims {
        claims_for(
            sentinel_types::new_id(),
            sentinel_types::new_id(),
            sentinel_types::new_id(),
            ttl,
        )
    }

    #[test]
    fn issue_verify_round_trip() {
        let key = generate_signing_key(sentinel_types::new_id(), None);
        let wanted = claims(3600);
        let token = issue(&key, &wanted).expect("issue");
        assert_eq!(peek_kid(&token).expect("kid"), key.id);
        let got = verify(&key, &token, clock::now()).expect("verify");
        assert_eq!(got, wanted);
    }

    #[test]
    fn expired_token_is_invalid_claims() {
        let key = generate_signing_key(sentinel_types::new_id(), None);
        let token = issue(&key, &claims(-10)).expect("issue");
        let err = verify(&key, &token, clock::now()).unwrap_err();
        assert_eq!(err.kind(), "invalid_claims");
    }

    #[test]
    fn deactivated_key_rejects_before_signature_check() {
        let mut key = generate_signing_key(sentinel_types::new_id(), None);
        let token = issue(&key, &claims(3600)).expect("issue");
        key.active = false;
        let err = verify(&key, &token, clock::now()).unwrap_err();
        assert_eq!(err.kind(), "key_deactivated");
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let key = generate_signing_key(sentinel_types::new_id(), None);
        let token = issue(&key, &claims(3600)).expect("issue");
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = B64.encode(
            serde_json::to_vec(&claims(7200)).expect("claims"),
        );
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert_eq!(
            verify(&key, &forged_token, clock::now()).unwrap_err(),
            EngineError::InvalidKey
        );
    }

    #[test]
    fn garbage_is_invalid_key() {
        let key = generate_signing_key(sentinel_types::new_id(), None);
        assert_eq!(verify(&key, "abc", clock::now()).unwrap_err(), EngineError::InvalidKey);
        assert_eq!(peek_kid("%%%").unwrap_err(), EngineError::InvalidKey);
    }
}
