//! Application state management

use std::sync::Arc;

use crate::config::{Config, StorageBackend};
use crate::events::EventHub;
use crate::upload::{ArtifactStore, ChunkReaper, ChunkStore, MergeOptions, UploadService};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    uploads: UploadService,
    events: EventHub,
}

impl AppState {
    /// Create a new application state from configuration
    pub fn new(config: Config) -> Self {
        let store = match config.storage.backend {
            StorageBackend::Local => ChunkStore::with_local_storage(config.storage.chunk_dir.clone()),
            StorageBackend::Memory => ChunkStore::in_memory(),
        };
        let artifacts = ArtifactStore::new(config.storage.output_dir.clone());
        let options = MergeOptions {
            buffer_size: config.storage.merge_buffer_size,
            cleanup_after_merge: config.storage.cleanup_after_merge,
        };

        Self {
            inner: Arc::new(AppStateInner {
                uploads: UploadService::new(store, artifacts, options),
                events: EventHub::new(),
                config,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }

    /// Get the websocket event hub
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    /// Reaper for abandoned chunk namespaces, not yet started
    pub fn chunk_reaper(&self) -> ChunkReaper {
        let retention = &self.inner.config.retention;
        ChunkReaper::new(
            self.inner.uploads.store().clone(),
            self.inner.uploads.registry().clone(),
            retention.chunk_ttl(),
            retention.reap_interval(),
        )
    }
}
