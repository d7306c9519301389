//! Key material: Ed25519 signing keys, one-time node secrets, API keys.
//!
//! Raw secrets leave this module exactly once, at generation time. Storage
//! only ever sees SHA-256 digests (node and API keys) or the org keypair
//! (signing keys, whose at-rest protection is the store's concern).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey as DalekKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use sentinel_types::{EngineError, SigningKey, clock};

/// Generate a fresh Ed25519 signing key for an organization.
pub fn generate_signing_key(org_id: Uuid, expires_at: Option<DateTime<Utc>>) -> SigningKey {
    let seed: [u8; 32] = rand::random();
    let key = DalekKey::from_bytes(&seed);
    SigningKey {
        id: sentinel_types::new_id(),
        org_id,
        public_key: B64.encode(key.verifying_key().as_bytes()),
        private_key: B64.encode(seed),
        active: true,
        created_at: clock::now(),
        expires_at,
    }
}

/// Sign `payload` with a stored signing key. Returns the signature base64url.
pub fn sign(key: &SigningKey, payload: &[u8]) -> Result<String, EngineError> {
    let signer = decode_private(key)?;
    let sig: Signature = signer.sign(payload);
    Ok(B64.encode(sig.to_bytes()))
}

/// Verify a base64url signature against a stored key's public half.
pub fn verify(key: &SigningKey, payload: &[u8], signature: &str) -> Result<bool, EngineError> {
    let verifier = decode_public(key)?;
    let raw = B64.decode(signature).map_err(|_| EngineError::InvalidKey)?;
    let bytes: [u8; 64] = raw.as_slice().try_into().map_err(|_| EngineError::InvalidKey)?;
    let sig = Signature::from_bytes(&bytes);
    Ok(verifier.verify(payload, &sig).is_ok())
}

pub(crate) fn decode_private(key: &SigningKey) -> Result<DalekKey, EngineError> {
    let raw = B64.decode(&key.private_key).map_err(|_| EngineError::InvalidKey)?;
    let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| EngineError::InvalidKey)?;
    Ok(DalekKey::from_bytes(&seed))
}

pub(crate) fn decode_public(key: &SigningKey) -> Result<VerifyingKey, EngineError> {
    let raw = B64.decode(&key.public_key).map_err(|_| EngineError::InvalidKey)?;
    let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| EngineError::InvalidKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| EngineError::InvalidKey)
}

/// A freshly generated bearer secret and its storable digest.
#[derive(Debug, Clone)]
pub struct IssuedSecret {
    /// 256-bit random value, base64url. Returned to the caller exactly once.
    pub secret: String,
    /// SHA-256 hex of `secret`; the only form that is ever persisted.
    pub hash: String,
}

/// Generate a node or API key secret.
pub fn generate_secret() -> IssuedSecret {
    let raw: [u8; 32] = rand::random();
    let secret = B64.encode(raw);
    let hash = hash_secret(&secret);
    IssuedSecret { secret, hash }
}

/// SHA-256 hex digest of a bearer secret, as stored and looked up.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Payload signed for bundle provenance: the checksum hex followed by the
/// exact archive bytes.
pub fn bundle_signing_payload(checksum: &str, archive: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(checksum.len() + archive.len());
    payload.extend_from_slice(checksum.as_bytes());
    payload.extend_from_slice(archive);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let key = generate_signing_key(sentinel_types::new_id(), None);
        let sig = sign(&key, b"manifest bytes").expect("sign");
        assert!(verify(&key, b"manifest bytes", &sig).expect("verify"));
        assert!(!verify(&key, b"tampered bytes", &sig).expect("verify"));
    }

    #[test]
    fn signature_is_not_transferable_between_keys() {
        let a = generate_signing_key(sentinel_types::new_id(), None);
        let b = generate_signing_key(sentinel_types::new_id(), None);
        let sig = sign(&a, b"payload").expect("sign");
        assert!(!verify(&b, b"payload", &sig).expect("verify"));
    }

    #[test]
    fn generated_secret_hash_matches() {
        let issued = generate_secret();
        assert_eq!(issued.hash, hash_secret(&issued.secret));
        assert_eq!(issued.hash.len(), 64);
        // The stored digest never contains the raw secret.
        assert!(!issued.hash.contains(&issued.secret));
    }

    #[test]
    fn secrets_are_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn bundle_payload_binds_checksum_and_bytes() {
        let key = generate_signing_key(sentinel_types::new_id(), None);
        let payload = bundle_signing_payload("abcd", b"archive");
        let sig = sign(&key, &payload).expect("sign");
        assert!(verify(&key, &payload, &sig).expect("verify"));
        let other = bundle_signing_payload("abce", b"archive");
        assert!(!verify(&key, &other, &sig).expect("verify"));
    }

    #[test]
    fn malformed_key_material_is_invalid_key() {
        let mut key = generate_signing_key(sentinel_types::new_id(), None);
        key.public_key = "!!not-base64!!".into();
        assert_eq!(verify(&key, b"x", "AAAA").unwrap_err(), EngineError::InvalidKey);
    }
}
