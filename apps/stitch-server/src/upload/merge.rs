//! Merge Engine
//!
//! Reassembles an identity's chunks into one artifact. Chunks are streamed
//! in ascending numeric index order through a bounded read window, so memory
//! use does not depend on file or chunk size.

use std::io::ErrorKind;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::artifact::ArtifactStore;
use super::chunk_store::{ChunkReader, ChunkStore};
use super::notify::NotificationSink;
use super::session::{SessionRegistry, UploadSession};
use super::types::{
    CompletionRecord, MergeOutcome, MergeReport, UploadError, UploadIdentity, DEFAULT_MERGE_BUFFER_SIZE,
};

/// Merge tuning
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Read window per chunk, independent of chunk size
    pub buffer_size: usize,
    /// Delete chunk bodies once the artifact is published
    pub cleanup_after_merge: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_MERGE_BUFFER_SIZE,
            cleanup_after_merge: true,
        }
    }
}

#[derive(Clone)]
pub struct MergeEngine {
    store: ChunkStore,
    artifacts: ArtifactStore,
    registry: SessionRegistry,
    options: MergeOptions,
}

impl MergeEngine {
    pub fn new(
        store: ChunkStore,
        artifacts: ArtifactStore,
        registry: SessionRegistry,
        options: MergeOptions,
    ) -> Self {
        Self {
            store,
            artifacts,
            registry,
            options,
        }
    }

    /// Merge an identity into `name`, reporting the outcome to `sink`.
    ///
    /// The sink hears exactly one `finish`, whether the merge succeeds or not.
    pub async fn merge(
        &self,
        identity: &UploadIdentity,
        total: u64,
        name: &str,
        sink: &dyn NotificationSink,
    ) -> Result<MergeReport, UploadError> {
        let result = self.run(identity, total, name, sink).await;

        match &result {
            Ok(report) => {
                sink.finish(identity, &MergeOutcome::success(report), Some(report))
                    .await;
            }
            Err(e) => {
                if matches!(e, UploadError::Io(_)) {
                    tracing::error!(identity = %identity, name = %name, error = %e, "Merge failed");
                } else {
                    tracing::warn!(identity = %identity, name = %name, error = %e, "Merge rejected");
                }
                sink.finish(identity, &MergeOutcome::failure(e), None).await;
            }
        }

        result
    }

    async fn run(
        &self,
        identity: &UploadIdentity,
        total: u64,
        name: &str,
        sink: &dyn NotificationSink,
    ) -> Result<MergeReport, UploadError> {
        ArtifactStore::validate_name(name)?;
        self.registry.declare_total(identity, total)?;

        // No chunk writes from here on; the snapshot below stays accurate
        let _guard = self.registry.begin_exclusive(identity).await?;

        if let Some(report) = self.reuse_completed(identity, total, name).await? {
            return Ok(report);
        }

        let present = self.store.list_indices(identity).await?;
        let session = UploadSession::new(identity.clone(), total, present);
        if !session.is_complete() {
            return Err(UploadError::Incomplete {
                missing: session.missing(),
                unexpected: session.unexpected(),
            });
        }

        if self.artifacts.exists(name).await? {
            return Err(UploadError::ArtifactExists(name.to_string()));
        }

        tracing::info!(
            identity = %identity,
            name = %name,
            chunks = total,
            "Merging chunks"
        );

        let mut partial = self.artifacts.begin(name).await?;
        let mut hasher = Sha256::new();
        let mut window = vec![0u8; self.options.buffer_size.max(1)];
        let mut size = 0u64;

        for index in 0..total {
            let mut chunk = self.open(identity, index).await?;
            loop {
                let n = chunk.read(&mut window).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&window[..n]);
                partial.file_mut().write_all(&window[..n]).await?;
                size += n as u64;
            }
            sink.progress(identity, index + 1, total).await;
        }

        partial.commit().await?;

        let record = CompletionRecord {
            total,
            artifact: name.to_string(),
            size,
            sha256: hex::encode(hasher.finalize()),
            merged_at: Utc::now(),
        };
        if let Err(e) = self.store.write_completion(identity, &record).await {
            // An artifact without a completion record must not stay published
            if let Err(remove_err) = self.artifacts.remove(name).await {
                tracing::error!(
                    identity = %identity,
                    name = %name,
                    error = %remove_err,
                    "Failed to withdraw artifact after completion write failed"
                );
            }
            return Err(e);
        }

        if self.options.cleanup_after_merge {
            // The artifact is already published; leftover chunks are reaped later
            if let Err(e) = self.store.remove_chunks(identity).await {
                tracing::warn!(identity = %identity, error = %e, "Failed to remove merged chunks");
            }
        }

        tracing::info!(
            identity = %identity,
            name = %name,
            size = size,
            sha256 = %record.sha256,
            "Merge complete"
        );

        Ok(MergeReport {
            artifact: record.artifact,
            size,
            sha256: record.sha256,
            chunks: total,
            reused: false,
        })
    }

    async fn open(&self, identity: &UploadIdentity, index: u64) -> Result<ChunkReader, UploadError> {
        match self.store.open_chunk(identity, index).await {
            Err(UploadError::Io(e)) if e.kind() == ErrorKind::NotFound => Err(UploadError::Incomplete {
                missing: vec![index],
                unexpected: Vec::new(),
            }),
            other => other,
        }
    }

    /// Satisfy a merge from an earlier one of the same identity.
    ///
    /// Same name: nothing to do. Different name: publish a copy.
    async fn reuse_completed(
        &self,
        identity: &UploadIdentity,
        total: u64,
        name: &str,
    ) -> Result<Option<MergeReport>, UploadError> {
        let Some(record) = self.store.read_completion(identity).await? else {
            return Ok(None);
        };

        if record.total != total {
            return Err(UploadError::InconsistentTotal {
                declared: total,
                previous: record.total,
            });
        }

        if !self.artifacts.exists(&record.artifact).await? {
            tracing::warn!(
                identity = %identity,
                artifact = %record.artifact,
                "Merged artifact is gone, merging again"
            );
            self.store.clear_completion(identity).await?;
            return Ok(None);
        }

        if record.artifact != name {
            self.artifacts.copy(&record.artifact, name).await?;
        }

        tracing::info!(
            identity = %identity,
            name = %name,
            source = %record.artifact,
            "Reused earlier merge"
        );

        Ok(Some(MergeReport {
            artifact: name.to_string(),
            size: record.size,
            sha256: record.sha256,
            chunks: total,
            reused: true,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================
