//! Upload Service
//!
//! The three protocol operations (check, upload, merge) shared by the HTTP
//! and websocket bindings.

use super::artifact::ArtifactStore;
use super::chunk_store::ChunkStore;
use super::merge::{MergeEngine, MergeOptions};
use super::notify::NotificationSink;
use super::probe::ResumeProbe;
use super::session::SessionRegistry;
use super::types::{MergeReport, ProbeResult, UploadError, UploadIdentity, UploadReceipt};

#[derive(Clone)]
pub struct UploadService {
    store: ChunkStore,
    artifacts: ArtifactStore,
    registry: SessionRegistry,
    probe: ResumeProbe,
    merger: MergeEngine,
}

impl UploadService {
    pub fn new(store: ChunkStore, artifacts: ArtifactStore, options: MergeOptions) -> Self {
        let registry = SessionRegistry::new();
        let probe = ResumeProbe::new(store.clone(), artifacts.clone(), registry.clone());
        let merger = MergeEngine::new(store.clone(), artifacts.clone(), registry.clone(), options);

        Self {
            store,
            artifacts,
            registry,
            probe,
            merger,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Resume check
    pub async fn check(&self, identity: &UploadIdentity, total: u64) -> Result<ProbeResult, UploadError> {
        let result = self.probe.probe(identity, total).await?;

        tracing::debug!(
            identity = %identity,
            total = total,
            state = ?result.state,
            present = result.present.len(),
            "Checked upload"
        );

        Ok(result)
    }

    /// Store one chunk.
    ///
    /// `total` is optional here; when given it must agree with earlier
    /// declarations and bounds the index.
    pub async fn upload_chunk(
        &self,
        identity: &UploadIdentity,
        index: u64,
        data: &[u8],
        total: Option<u64>,
    ) -> Result<UploadReceipt, UploadError> {
        if let Some(total) = total {
            self.registry.declare_total(identity, total)?;
        }
        if let Some(total) = total.or_else(|| self.registry.declared_total(identity)) {
            if index >= total {
                return Err(UploadError::IndexOutOfRange { index, total });
            }
        }

        let _permit = self.registry.begin_upload(identity).await?;

        // Already merged: nothing left to store, unless the artifact is gone
        if let Some(record) = self.store.read_completion(identity).await? {
            if self.artifacts.exists(&record.artifact).await? {
                tracing::debug!(identity = %identity, index = index, "Chunk for merged identity discarded");
                return Ok(UploadReceipt {
                    index,
                    stored: false,
                    size: data.len() as u64,
                });
            }

            tracing::warn!(
                identity = %identity,
                artifact = %record.artifact,
                "Merged artifact is gone, accepting chunks again"
            );
            self.store.clear_completion(identity).await?;
        }

        self.store.put(identity, index, data).await?;

        Ok(UploadReceipt {
            index,
            stored: true,
            size: data.len() as u64,
        })
    }

    /// Merge all chunks into `name`
    pub async fn merge(
        &self,
        identity: &UploadIdentity,
        total: u64,
        name: &str,
        sink: &dyn NotificationSink,
    ) -> Result<MergeReport, UploadError> {
        self.merger.merge(identity, total, name, sink).await
    }
}

// ============================================================================
// Tests
// ============================================================================
