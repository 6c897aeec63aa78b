//! Chunk Reaper
//!
//! Background cleanup of abandoned uploads. A namespace untouched for longer
//! than the TTL is removed; for merged identities only the chunk bodies go
//! and the completion record stays, so later checks still dedupe.

use std::time::Duration;

use chrono::Utc;

use super::chunk_store::ChunkStore;
use super::session::SessionRegistry;
use super::types::UploadError;

/// Totals from one reaper pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub namespaces_removed: usize,
    pub chunks_removed: usize,
    pub sessions_forgotten: usize,
}

#[derive(Clone)]
pub struct ChunkReaper {
    store: ChunkStore,
    registry: SessionRegistry,
    ttl: chrono::Duration,
    interval: Duration,
}

impl ChunkReaper {
    pub fn new(store: ChunkStore, registry: SessionRegistry, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            registry,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
            interval,
        }
    }

    /// Run one cleanup pass
    pub async fn reap_once(&self) -> Result<ReapStats, UploadError> {
        let cutoff = Utc::now() - self.ttl;
        let mut stats = ReapStats::default();

        for listed in self.store.list_namespaces().await? {
            if listed.modified > cutoff {
                continue;
            }

            // Skip identities a merge is working on; no uploads while we delete
            let guard = match self.registry.begin_exclusive(&listed.identity).await {
                Ok(guard) => guard,
                Err(UploadError::MergeInProgress(_)) => continue,
                Err(e) => return Err(e),
            };

            // The listing may be outdated by the time the guard is held
            let namespace = match self.store.stat_namespace(&listed.identity).await? {
                Some(namespace) if namespace.modified <= cutoff => namespace,
                _ => continue,
            };

            if namespace.completed {
                stats.chunks_removed += self.store.remove_chunks(&namespace.identity).await?;
            } else {
                stats.chunks_removed += self.store.remove_namespace(&namespace.identity).await?;
                stats.namespaces_removed += 1;
            }

            drop(guard);
            if !namespace.completed {
                self.registry.forget(&namespace.identity);
            }
        }

        stats.sessions_forgotten = self.registry.forget_idle(cutoff);

        if stats.namespaces_removed > 0 || stats.chunks_removed > 0 {
            tracing::info!(
                namespaces = stats.namespaces_removed,
                chunks = stats.chunks_removed,
                sessions = stats.sessions_forgotten,
                "Reaped stale uploads"
            );
        }

        Ok(stats)
    }

    /// Start background cleanup task
    pub fn start_task(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;
                if let Err(e) = self.reap_once().await {
                    tracing::warn!(error = %e, "Chunk reaper pass failed");
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
