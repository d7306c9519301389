//! Bundle lifecycle.
//!
//! Bundles are immutable, content-addressed configuration artifacts. This
//! crate owns their whole life: creation (`pending`), the single-claim
//! compile pipeline (`compiling → compiled | failed`), revocation, promotion
//! through the environment chain, diffs between revisions, and the object
//! store that holds the archives.
//!
//! The compile pipeline runs in this order: validate, stage, archive,
//! checksum, sign (optional), upload, SBOM, risk score, then one atomic
//! finish. Failures on any step land in `compiler_output` on the `failed`
//! row; they never propagate to whoever scheduled the job.

pub mod archive;
pub mod diff;
pub mod risk;
pub mod sbom;
pub mod storage;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use sentinel_dispatch::{Job, JobQueue};
use sentinel_identity::IdentityService;
use sentinel_store::{CompiledArtifact, Store};
use sentinel_types::{Bundle, BundleIn, EngineError, clock};

pub use archive::{BuiltArchive, Compression, build_archive, storage_key};
pub use diff::{DiffLine, DiffOp, FileSetDiff, diff_lines, diff_manifests};
pub use storage::{FsObjectStore, ObjectStore};
pub use validate::{ConfigValidator, RuleValidator, ValidationReport};

/// Compile-side configuration.
#[derive(Debug, Clone)]
pub struct BundleConfig {
    /// Sign compiled archives with the org's signing key.
    pub sign_bundles: bool,
    pub compression: Compression,
    /// TTL baked into presigned download references.
    pub presign_ttl: Duration,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            sign_bundles: false,
            compression: Compression::Zstd,
            presign_ttl: Duration::from_secs(300),
        }
    }
}

/// What one compile invocation did.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    /// Another worker holds or held the claim; nothing to do.
    AlreadyClaimed,
    Compiled(Bundle),
    Failed(Bundle),
}

/// Diff between two bundle revisions.
#[derive(Debug, Clone)]
pub struct BundleDiff {
    pub lines: Vec<DiffLine>,
    pub files: FileSetDiff,
}

/// Store-backed bundle operations.
#[derive(Clone)]
pub struct BundleService {
    store: Arc<dyn Store>,
    objects: Arc<dyn ObjectStore>,
    validator: Arc<dyn ConfigValidator>,
    identity: IdentityService,
    queue: JobQueue,
    config: BundleConfig,
}

impl BundleService {
    pub fn new(
        store: Arc<dyn Store>,
        objects: Arc<dyn ObjectStore>,
        validator: Arc<dyn ConfigValidator>,
        identity: IdentityService,
        queue: JobQueue,
        config: BundleConfig,
    ) -> Self {
        Self { store, objects, validator, identity, queue, config }
    }

    /// Create a `pending` bundle and schedule its compile.
    pub async fn create_bundle(&self, input: BundleIn) -> Result<Bundle, EngineError> {
        let project = self.store.get_project(input.project_id).await?;
        let mut bundle = Bundle::new(project.id, input.version, input.config_source);
        bundle.source_type = input.source_type;
        bundle.source_ref = input.source_ref;
        self.store.insert_bundle(bundle.clone()).await?;
        self.queue.enqueue(Job::CompileBundle { bundle_id: bundle.id });
        info!(bundle = %bundle.id, project = %project.id, version = %bundle.version, "bundle created");
        Ok(bundle)
    }

    /// Run the compile pipeline for one bundle.
    ///
    /// Exactly one invocation wins the `pending → compiling` claim; the rest
    /// observe [`CompileOutcome::AlreadyClaimed`] and exit, which makes the
    /// job safe to redeliver.
    pub async fn compile(&self, bundle_id: Uuid) -> Result<CompileOutcome, EngineError> {
        if !self.store.claim_bundle_for_compile(bundle_id).await? {
            return Ok(CompileOutcome::AlreadyClaimed);
        }
        let bundle = self.store.get_bundle(bundle_id).await?;
        let previous = self.store.latest_compiled_bundle(bundle.project_id).await?;

        let report = match self
            .validator
            .validate(bundle.project_id, &bundle.config_source)
            .await
        {
            Ok(report) => report,
            Err(err) => return self.fail(bundle_id, format!("validator failed: {err:#}")).await,
        };
        if report.has_errors() {
            return self.fail(bundle_id, report.render()).await;
        }

        let built = match build_archive(bundle_id, &bundle.config_source, self.config.compression) {
            Ok(built) => built,
            Err(err) => return self.fail(bundle_id, format!("archive failed: {err:#}")).await,
        };

        let (signature, signing_key_id) = if self.config.sign_bundles {
            match self
                .identity
                .sign_bundle(bundle.project_id, &built.checksum, &built.bytes)
                .await
            {
                Ok((signature, key_id)) => (Some(signature), Some(key_id)),
                Err(err) => {
                    return self.fail(bundle_id, format!("signing failed: {err}")).await;
                }
            }
        } else {
            (None, None)
        };

        let key = storage_key(bundle.project_id, bundle_id, built.compression);
        if let Err(err) = self.objects.put(&key, &built.bytes).await {
            return self.fail(bundle_id, format!("upload failed: {err:#}")).await;
        }

        let sbom = sbom::generate(bundle_id, &bundle.version, &bundle.config_source);
        let (risk_level, risk_reasons) = risk::score(
            &bundle.config_source,
            previous.as_ref().map(|b| b.config_source.as_str()),
        );

        let artifact = CompiledArtifact {
            checksum: built.checksum,
            size_bytes: built.bytes.len() as u64,
            storage_key: key,
            manifest: built.manifest,
            compiler_output: Some(report.render()),
            risk_level,
            risk_reasons,
            signature,
            signing_key_id,
            sbom: Some(sbom),
        };
        let compiled = self.store.finish_compile(bundle_id, artifact).await?;
        info!(bundle = %bundle_id, risk = ?compiled.risk_level, "bundle compiled");

        // An older compiled bundle that no live rollout references is now
        // superseded; one with live references keeps its status so those
        // rollouts' step re-checks stay valid.
        if let Some(previous) = previous
            && self.store.rollouts_referencing_bundle(previous.id).await?.is_empty()
        {
            self.store.mark_superseded(previous.id).await?;
        }
        Ok(CompileOutcome::Compiled(compiled))
    }

    async fn fail(&self, bundle_id: Uuid, output: String) -> Result<CompileOutcome, EngineError> {
        warn!(bundle = %bundle_id, "compile failed: {output}");
        let failed = self.store.fail_compile(bundle_id, output).await?;
        Ok(CompileOutcome::Failed(failed))
    }

    /// Revoke a compiled bundle and clear any staged pointers at it. Revoked
    /// bundles never serve new assignments; running rollouts observe the
    /// status change at their next step start.
    pub async fn revoke(&self, bundle_id: Uuid) -> Result<Bundle, EngineError> {
        let revoked = self.store.revoke_bundle(bundle_id).await?;
        info!(bundle = %bundle_id, "bundle revoked");
        Ok(revoked)
    }

    /// Delete a bundle that never compiled.
    pub async fn delete(&self, bundle_id: Uuid) -> Result<(), EngineError> {
        self.store.delete_bundle(bundle_id).await
    }

    /// Promote a bundle to an environment, enforcing the chain rule: every
    /// lower-ordinal environment of the project must already hold it.
    pub async fn promote(
        &self,
        bundle_id: Uuid,
        environment_id: Uuid,
        promoted_by: Uuid,
    ) -> Result<(), EngineError> {
        let bundle = self.store.get_bundle(bundle_id).await?;
        if !bundle.status.is_distributable() {
            return Err(EngineError::BundleNotCompiled(bundle_id));
        }
        let environments = self.store.list_environments(bundle.project_id).await?;
        let target = environments
            .iter()
            .find(|e| e.id == environment_id)
            .ok_or(EngineError::not_found("environment", environment_id))?;

        let promotions = self.store.list_promotions(bundle_id).await?;
        for env in environments.iter().filter(|e| e.ordinal < target.ordinal) {
            if !promotions.iter().any(|p| p.environment_id == env.id) {
                return Err(EngineError::invalid_state(format!(
                    "bundle must be promoted to {} (ordinal {}) first",
                    env.name, env.ordinal
                )));
            }
        }

        self.store
            .insert_promotion(sentinel_types::BundlePromotion {
                id: sentinel_types::new_id(),
                bundle_id,
                environment_id,
                promoted_at: clock::now(),
                promoted_by,
            })
            .await
    }

    /// Stage a compiled bundle onto explicit nodes (direct operator assign,
    /// outside any rollout).
    pub async fn assign(&self, bundle_id: Uuid, node_ids: &[Uuid]) -> Result<(), EngineError> {
        let bundle = self.store.get_bundle(bundle_id).await?;
        if !bundle.status.is_distributable() {
            return Err(EngineError::BundleNotCompiled(bundle_id));
        }
        let nodes = self.store.nodes_by_ids(bundle.project_id, node_ids).await?;
        let accepting: Vec<Uuid> = nodes
            .iter()
            .filter(|n| n.accepts_bundle(bundle_id))
            .map(|n| n.id)
            .collect();
        self.store.set_staged_bundle(&accepting, bundle_id).await
    }

    /// Diff two revisions: source lines plus the manifest file set.
    pub async fn diff(&self, old_id: Uuid, new_id: Uuid) -> Result<BundleDiff, EngineError> {
        let old = self.store.get_bundle(old_id).await?;
        let new = self.store.get_bundle(new_id).await?;
        let files = match (&old.manifest, &new.manifest) {
            (Some(a), Some(b)) => diff_manifests(a, b),
            _ => FileSetDiff::default(),
        };
        Ok(BundleDiff { lines: diff_lines(&old.config_source, &new.config_source), files })
    }

    /// Presigned download reference for a compiled bundle.
    pub async fn download_url(&self, bundle: &Bundle) -> Result<String, EngineError> {
        let key = bundle
            .storage_key
            .as_deref()
            .ok_or(EngineError::BundleNotCompiled(bundle.id))?;
        self.objects
            .presign_get(key, self.config.presign_ttl)
            .await
            .map_err(|_| EngineError::BundleNotCompiled(bundle.id))
    }
}
