//! Identity and token service.
//!
//! Per-organization Ed25519 signing keys, one-time node credentials, API-key
//! hashing, and node bearer tokens (compact JWS). See [`IdentityService`] for
//! the store-backed surface; the [`keys`] and [`token`] modules hold the pure
//! primitives.
//!
//! Two credential forms authenticate a node and are treated as equivalent:
//! the raw registration key (looked up by SHA-256 digest) and a token
//! previously exchanged for it.

pub mod keys;
pub mod token;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use sentinel_store::Store;
use sentinel_types::{ApiKey, EngineError, Node, SigningKey, User, clock};

pub use keys::{IssuedSecret, bundle_signing_payload, generate_secret, generate_signing_key, hash_secret};
pub use token::TokenClaims;

/// Token issuance knobs.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Node token lifetime in seconds.
    pub node_token_ttl_seconds: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { node_token_ttl_seconds: 3600 }
    }
}

/// Store-backed identity operations.
#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn Store>,
    config: TokenConfig,
}

impl IdentityService {
    pub fn new(store: Arc<dyn Store>, config: TokenConfig) -> Self {
        Self { store, config }
    }

    /// The org key that currently signs for a project, or `no_signing_key`.
    pub async fn signing_key_for_project(&self, project_id: Uuid) -> Result<SigningKey, EngineError> {
        let project = self.store.get_project(project_id).await?;
        self.store
            .active_signing_key(project.org_id, clock::now())
            .await?
            .ok_or(EngineError::NoSigningKey)
    }

    /// Generate a fresh signing key for an organization and deactivate the
    /// previous one. Tokens signed by the old key stop verifying; nodes
    /// re-exchange their registration key for a fresh token.
    pub async fn rotate_signing_key(&self, org_id: Uuid) -> Result<SigningKey, EngineError> {
        let previous = self.store.active_signing_key(org_id, clock::now()).await?;
        let key = generate_signing_key(org_id, None);
        self.store.insert_signing_key(key.clone()).await?;
        if let Some(previous) = previous {
            self.store.deactivate_signing_key(previous.id).await?;
        }
        Ok(key)
    }

    /// Issue a bearer token for a node, signed by its org's current key.
    pub async fn issue_node_token(
        &self,
        node: &Node,
    ) -> Result<(String, DateTime<Utc>), EngineError> {
        let key = self.signing_key_for_project(node.project_id).await?;
        let project = self.store.get_project(node.project_id).await?;
        let claims = token::claims_for(
            node.id,
            node.project_id,
            project.org_id,
            self.config.node_token_ttl_seconds,
        );
        let expires_at = claims.expires_at().unwrap_or_else(clock::now);
        let signed = token::issue(&key, &claims)?;
        Ok((signed, expires_at))
    }

    /// Verify a node token end to end: `kid` resolution, key usability,
    /// signature, and claim window.
    pub async fn verify_node_token(&self, raw: &str) -> Result<TokenClaims, EngineError> {
        let kid = token::peek_kid(raw)?;
        let key = self.store.get_signing_key(kid).await?;
        token::verify(&key, raw, clock::now())
    }

    /// Authenticate a bearer credential as `node_id`.
    ///
    /// Raw keys and tokens are equivalent: a digest match wins immediately,
    /// anything else must parse and verify as a token whose `sub` is the
    /// node. A credential for a different node is `not_authorized`.
    pub async fn authenticate_node(
        &self,
        node_id: Uuid,
        bearer: &str,
    ) -> Result<Node, EngineError> {
        if let Some(node) = self.store.find_node_by_key_hash(&hash_secret(bearer)).await? {
            if node.id != node_id {
                return Err(EngineError::NotAuthorized);
            }
            return Ok(node);
        }
        let claims = self.verify_node_token(bearer).await?;
        if claims.sub != node_id {
            return Err(EngineError::NotAuthorized);
        }
        self.store.get_node(node_id).await
    }

    /// Create an API key for a user; the raw secret is returned exactly once.
    pub async fn create_api_key(
        &self,
        user_id: Uuid,
        name: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(ApiKey, String), EngineError> {
        let issued = generate_secret();
        let key = ApiKey {
            id: sentinel_types::new_id(),
            user_id,
            name: name.into(),
            key_hash: issued.hash,
            created_at: clock::now(),
            expires_at,
            revoked_at: None,
        };
        self.store.insert_api_key(key.clone()).await?;
        Ok((key, issued.secret))
    }

    /// Resolve an API-key secret to its user. Revoked and expired keys are
    /// indistinguishable from unknown ones.
    pub async fn authenticate_api_key(&self, secret: &str) -> Result<User, EngineError> {
        let key = self
            .store
            .find_api_key_by_hash(&hash_secret(secret))
            .await?
            .ok_or(EngineError::InvalidKey)?;
        if !key.is_active(clock::now()) {
            return Err(EngineError::InvalidKey);
        }
        self.store.get_user(key.user_id).await
    }

    /// Sign a compiled bundle's payload with the project org's current key.
    pub async fn sign_bundle(
        &self,
        project_id: Uuid,
        checksum: &str,
        archive: &[u8],
    ) -> Result<(String, Uuid), EngineError> {
        let key = self.signing_key_for_project(project_id).await?;
        let payload = bundle_signing_payload(checksum, archive);
        Ok((keys::sign(&key, &payload)?, key.id))
    }

    /// Verify a bundle signature against the key it references.
    pub async fn verify_bundle_signature(
        &self,
        signing_key_id: Uuid,
        checksum: &str,
        archive: &[u8],
        signature: &str,
    ) -> Result<bool, EngineError> {
        let key = self.store.get_signing_key(signing_key_id).await?;
        let payload = bundle_signing_payload(checksum, archive);
        keys::verify(&key, &payload, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_store::MemoryStore;
    use sentinel_types::{Organization, Project, ProjectSettings};

    async fn fixture() -> (Arc<dyn Store>, IdentityService, Uuid, Uuid) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let org_id = sentinel_types::new_id();
        let project_id = sentinel_types::new_id();
        store
            .insert_organization(Organization {
                id: org_id,
                name: "acme".into(),
                created_at: clock::now(),
            })
            .await
            .expect("org");
        store
            .insert_project(Project {
                id: project_id,
                org_id,
                name: "edge".into(),
                slug: "edge".into(),
                settings: ProjectSettings::default(),
                created_at: clock::now(),
            })
            .await
            .expect("project");
        let service = IdentityService::new(Arc::clone(&store), TokenConfig::default());
        (store, service, org_id, project_id)
    }

    fn test_node(project_id: Uuid, key_hash: String) -> Node {
        let now = clock::now();
        Node {
            id: sentinel_types::new_id(),
            project_id,
            name: "edge-1".into(),
            labels: Default::default(),
            capabilities: Default::default(),
            version: None,
            status: sentinel_types::NodeStatus::Online,
            last_seen_at: now,
            registered_at: now,
            ip: None,
            hostname: None,
            node_key_hash: key_hash,
            active_bundle_id: None,
            staged_bundle_id: None,
            expected_bundle_id: None,
            pinned_bundle_id: None,
            min_bundle_version: None,
            max_bundle_version: None,
            environment_id: None,
            runtime_config_hash: None,
        }
    }

    #[tokio::test]
    async fn token_issue_requires_a_signing_key() {
        let (store, service, org_id, project_id) = fixture().await;
        let node = test_node(project_id, "x".into());
        store.insert_node(node.clone()).await.expect("node");

        let err = service.issue_node_token(&node).await.unwrap_err();
        assert_eq!(err.kind(), "no_signing_key");

        store
            .insert_signing_key(generate_signing_key(org_id, None))
            .await
            .expect("key");
        let (token, expires_at) = service.issue_node_token(&node).await.expect("issue");
        assert!(expires_at > clock::now());
        let claims = service.verify_node_token(&token).await.expect("verify");
        assert_eq!(claims.sub, node.id);
    }

    #[tokio::test]
    async fn raw_key_and_token_are_equivalent_credentials() {
        let (store, service, org_id, project_id) = fixture().await;
        store
            .insert_signing_key(generate_signing_key(org_id, None))
            .await
            .expect("key");
        let issued = generate_secret();
        let node = test_node(project_id, issued.hash.clone());
        store.insert_node(node.clone()).await.expect("node");

        let by_key = service
            .authenticate_node(node.id, &issued.secret)
            .await
            .expect("raw key auth");
        assert_eq!(by_key.id, node.id);

        let (token, _) = service.issue_node_token(&node).await.expect("issue");
        let by_token = service.authenticate_node(node.id, &token).await.expect("token auth");
        assert_eq!(by_token.id, node.id);
    }

    #[tokio::test]
    async fn credential_for_another_node_is_not_authorized() {
        let (store, service, org_id, project_id) = fixture().await;
        store
            .insert_signing_key(generate_signing_key(org_id, None))
            .await
            .expect("key");
        let issued = generate_secret();
        let node = test_node(project_id, issued.hash.clone());
        store.insert_node(node.clone()).await.expect("node");

        let err = service
            .authenticate_node(sentinel_types::new_id(), &issued.secret)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_authorized");
    }

    #[tokio::test]
    async fn rotation_invalidates_old_tokens() {
        let (store, service, org_id, project_id) = fixture().await;
        store
            .insert_signing_key(generate_signing_key(org_id, None))
            .await
            .expect("key");
        let node = test_node(project_id, "x".into());
        store.insert_node(node.clone()).await.expect("node");

        let (old_token, _) = service.issue_node_token(&node).await.expect("issue");
        service.rotate_signing_key(org_id).await.expect("rotate");

        let err = service.verify_node_token(&old_token).await.unwrap_err();
        assert_eq!(err.kind(), "key_deactivated");

        let (new_token, _) = service.issue_node_token(&node).await.expect("reissue");
        assert_eq!(
            service.verify_node_token(&new_token).await.expect("verify").sub,
            node.id
        );
    }

    #[tokio::test]
    async fn api_key_lifecycle() {
        let (store, service, org_id, _) = fixture().await;
        let user = User {
            id: sentinel_types::new_id(),
            org_id,
            name: "op".into(),
            role: sentinel_types::Role::Operator,
        };
        store.insert_user(user.clone()).await.expect("user");

        let (record, secret) = service
            .create_api_key(user.id, "ci", None)
            .await
            .expect("create");
        assert_ne!(record.key_hash, secret);

        let resolved = service.authenticate_api_key(&secret).await.expect("auth");
        assert_eq!(resolved.id, user.id);

        store.revoke_api_key(record.id, clock::now()).await.expect("revoke");
        assert_eq!(
            service.authenticate_api_key(&secret).await.unwrap_err(),
            EngineError::InvalidKey
        );
    }

    #[tokio::test]
    async fn bundle_signature_round_trip() {
        let (store, service, org_id, project_id) = fixture().await;
        store
            .insert_signing_key(generate_signing_key(org_id, None))
            .await
            .expect("key");

        let archive = b"tar+zstd bytes";
        let checksum = "ff".repeat(32);
        let (signature, key_id) = service
            .sign_bundle(project_id, &checksum, archive)
            .await
            .expect("sign");
        assert!(
            service
                .verify_bundle_signature(key_id, &checksum, archive, &signature)
                .await
                .expect("verify")
        );
        assert!(
            !service
                .verify_bundle_signature(key_id, &checksum, b"other bytes", &signature)
                .await
                .expect("verify")
        );
    }
}
