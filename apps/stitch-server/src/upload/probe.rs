//! Resume probe
//!
//! Answers "what does the server already have for this identity?" so a
//! client can skip the upload, resume it, or start from scratch.

use super::artifact::ArtifactStore;
use super::chunk_store::ChunkStore;
use super::session::{SessionRegistry, UploadSession};
use super::types::{ProbeResult, ProbeState, UploadError, UploadIdentity};

#[derive(Clone)]
pub struct ResumeProbe {
    store: ChunkStore,
    artifacts: ArtifactStore,
    registry: SessionRegistry,
}

impl ResumeProbe {
    pub fn new(store: ChunkStore, artifacts: ArtifactStore, registry: SessionRegistry) -> Self {
        Self {
            store,
            artifacts,
            registry,
        }
    }

    /// Classify an identity against the caller's declared total
    pub async fn probe(&self, identity: &UploadIdentity, total: u64) -> Result<ProbeResult, UploadError> {
        self.registry.declare_total(identity, total)?;

        if let Some(record) = self.store.read_completion(identity).await? {
            if record.total != total {
                return Err(UploadError::InconsistentTotal {
                    declared: total,
                    previous: record.total,
                });
            }
            if self.artifacts.exists(&record.artifact).await? {
                tracing::debug!(
                    identity = %identity,
                    artifact = %record.artifact,
                    "Identity already merged"
                );
                return Ok(ProbeResult {
                    state: ProbeState::Complete,
                    present: Vec::new(),
                    missing: Vec::new(),
                    artifact: Some(record.artifact),
                });
            }

            tracing::warn!(
                identity = %identity,
                artifact = %record.artifact,
                "Merged artifact is gone, discarding completion record"
            );
            self.store.clear_completion(identity).await?;
        }

        if !self.store.exists(identity).await? {
            return Ok(ProbeResult {
                state: ProbeState::Absent,
                present: Vec::new(),
                missing: (0..total).collect(),
                artifact: None,
            });
        }

        let present = self.store.list_indices(identity).await?;
        let session = UploadSession::new(identity.clone(), total, present);

        Ok(ProbeResult {
            state: session.state(),
            missing: session.missing(),
            present: session.present.into_iter().collect(),
            artifact: None,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
