//! Chunk Store
//!
//! Durable storage for uploaded chunks, grouped into one namespace per
//! upload identity. Supports local filesystem and in-memory backends.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use super::types::{CompletionRecord, UploadError, UploadIdentity};

/// File name of the completion record inside a namespace directory
pub const COMPLETION_RECORD_FILE: &str = ".complete.json";

/// Sequential reader over one stored chunk
pub type ChunkReader = Box<dyn AsyncRead + Send + Unpin>;

/// A namespace found while scanning storage
#[derive(Debug, Clone)]
pub struct NamespaceEntry {
    pub identity: UploadIdentity,
    /// Last time a chunk was added, replaced or removed
    pub modified: DateTime<Utc>,
    /// Whether a completion record is present
    pub completed: bool,
}

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Store a chunk, replacing any previous body at the same index.
    /// The chunk becomes visible to `list_indices` only once fully written.
    async fn put(&self, identity: &UploadIdentity, index: u64, data: &[u8]) -> Result<(), UploadError>;

    /// Indices currently stored for the identity (empty if none)
    async fn list_indices(&self, identity: &UploadIdentity) -> Result<BTreeSet<u64>, UploadError>;

    /// Whether the identity's namespace exists at all
    async fn exists(&self, identity: &UploadIdentity) -> Result<bool, UploadError>;

    /// Open one chunk for sequential reading
    async fn open_chunk(&self, identity: &UploadIdentity, index: u64) -> Result<ChunkReader, UploadError>;

    /// Delete every chunk body, keeping the namespace and its completion record
    async fn remove_chunks(&self, identity: &UploadIdentity) -> Result<usize, UploadError>;

    /// Delete the whole namespace
    async fn remove_namespace(&self, identity: &UploadIdentity) -> Result<usize, UploadError>;

    async fn write_completion(
        &self,
        identity: &UploadIdentity,
        record: &CompletionRecord,
    ) -> Result<(), UploadError>;

    async fn read_completion(
        &self,
        identity: &UploadIdentity,
    ) -> Result<Option<CompletionRecord>, UploadError>;

    async fn clear_completion(&self, identity: &UploadIdentity) -> Result<(), UploadError>;

    /// Every namespace in storage
    async fn list_namespaces(&self) -> Result<Vec<NamespaceEntry>, UploadError>;

    /// Current state of one namespace, `None` if it does not exist
    async fn stat_namespace(&self, identity: &UploadIdentity) -> Result<Option<NamespaceEntry>, UploadError>;
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Main chunk store with pluggable backends
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// Storage backend
    backend: Box<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Create with local filesystem storage
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::with_backend(Box::new(LocalChunkStorage::new(base_path)))
    }

    /// Create with in-memory storage (lost on restart)
    pub fn in_memory() -> Self {
        Self::with_backend(Box::new(MemoryChunkStorage::default()))
    }

    pub fn with_backend(backend: Box<dyn ChunkStorage>) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner { backend }),
        }
    }

    /// Store a chunk
    pub async fn put(&self, identity: &UploadIdentity, index: u64, data: &[u8]) -> Result<(), UploadError> {
        self.inner.backend.put(identity, index, data).await?;

        tracing::debug!(
            identity = %identity,
            index = index,
            size = data.len(),
            "Stored chunk"
        );

        Ok(())
    }

    pub async fn list_indices(&self, identity: &UploadIdentity) -> Result<BTreeSet<u64>, UploadError> {
        self.inner.backend.list_indices(identity).await
    }

    pub async fn exists(&self, identity: &UploadIdentity) -> Result<bool, UploadError> {
        self.inner.backend.exists(identity).await
    }

    pub async fn open_chunk(&self, identity: &UploadIdentity, index: u64) -> Result<ChunkReader, UploadError> {
        self.inner.backend.open_chunk(identity, index).await
    }

    /// Delete chunk bodies after a merge
    pub async fn remove_chunks(&self, identity: &UploadIdentity) -> Result<usize, UploadError> {
        let removed = self.inner.backend.remove_chunks(identity).await?;
        if removed > 0 {
            tracing::debug!(identity = %identity, removed = removed, "Removed merged chunks");
        }
        Ok(removed)
    }

    /// Delete an abandoned namespace
    pub async fn remove_namespace(&self, identity: &UploadIdentity) -> Result<usize, UploadError> {
        let removed = self.inner.backend.remove_namespace(identity).await?;
        tracing::debug!(identity = %identity, removed = removed, "Removed chunk namespace");
        Ok(removed)
    }

    pub async fn write_completion(
        &self,
        identity: &UploadIdentity,
        record: &CompletionRecord,
    ) -> Result<(), UploadError> {
        self.inner.backend.write_completion(identity, record).await
    }

    pub async fn read_completion(
        &self,
        identity: &UploadIdentity,
    ) -> Result<Option<CompletionRecord>, UploadError> {
        self.inner.backend.read_completion(identity).await
    }

    pub async fn clear_completion(&self, identity: &UploadIdentity) -> Result<(), UploadError> {
        self.inner.backend.clear_completion(identity).await
    }

    pub async fn list_namespaces(&self) -> Result<Vec<NamespaceEntry>, UploadError> {
        self.inner.backend.list_namespaces().await
    }

    pub async fn stat_namespace(&self, identity: &UploadIdentity) -> Result<Option<NamespaceEntry>, UploadError> {
        self.inner.backend.stat_namespace(identity).await
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage
///
/// Layout: `<base>/<hash>-<chunkSize>/<hash>-<index>`. Chunks are written to a
/// dot-prefixed temporary file and renamed into place, so a partially written
/// chunk is never listed.
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn namespace_path(&self, identity: &UploadIdentity) -> PathBuf {
        self.base_path.join(identity.namespace_key())
    }

    fn chunk_path(&self, identity: &UploadIdentity, index: u64) -> PathBuf {
        self.namespace_path(identity).join(identity.chunk_key(index))
    }
}

/// Write `data` to `dir/name` via a temporary sibling and a rename
async fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> std::io::Result<()> {
    let final_path = dir.join(name);
    let temp_path = dir.join(format!(".{}.{}.part", name, Uuid::new_v4()));

    let written = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &final_path).await
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    sync_dir(dir).await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".part")
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn put(&self, identity: &UploadIdentity, index: u64, data: &[u8]) -> Result<(), UploadError> {
        let dir = self.namespace_path(identity);
        tokio::fs::create_dir_all(&dir).await?;
        write_atomic(&dir, &identity.chunk_key(index), data).await?;
        Ok(())
    }

    async fn list_indices(&self, identity: &UploadIdentity) -> Result<BTreeSet<u64>, UploadError> {
        let mut indices = BTreeSet::new();

        let mut entries = match tokio::fs::read_dir(self.namespace_path(identity)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Some(index) = identity.parse_chunk_key(&name) {
                if entry.file_type().await?.is_file() {
                    indices.insert(index);
                }
            }
        }

        Ok(indices)
    }

    async fn exists(&self, identity: &UploadIdentity) -> Result<bool, UploadError> {
        match tokio::fs::metadata(self.namespace_path(identity)).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_chunk(&self, identity: &UploadIdentity, index: u64) -> Result<ChunkReader, UploadError> {
        let file = tokio::fs::File::open(self.chunk_path(identity, index)).await?;
        Ok(Box::new(file))
    }

    async fn remove_chunks(&self, identity: &UploadIdentity) -> Result<usize, UploadError> {
        let mut entries = match tokio::fs::read_dir(self.namespace_path(identity)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let is_chunk = identity.parse_chunk_key(&name).is_some();
            if !is_chunk && !is_temp_file(&name) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) if is_chunk => removed += 1,
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(removed)
    }

    async fn remove_namespace(&self, identity: &UploadIdentity) -> Result<usize, UploadError> {
        let count = self.list_indices(identity).await?.len();
        match tokio::fs::remove_dir_all(self.namespace_path(identity)).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_completion(
        &self,
        identity: &UploadIdentity,
        record: &CompletionRecord,
    ) -> Result<(), UploadError> {
        let dir = self.namespace_path(identity);
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        write_atomic(&dir, COMPLETION_RECORD_FILE, &body).await?;
        Ok(())
    }

    async fn read_completion(
        &self,
        identity: &UploadIdentity,
    ) -> Result<Option<CompletionRecord>, UploadError> {
        let path = self.namespace_path(identity).join(COMPLETION_RECORD_FILE);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&body)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        Ok(Some(record))
    }

    async fn clear_completion(&self, identity: &UploadIdentity) -> Result<(), UploadError> {
        let path = self.namespace_path(identity).join(COMPLETION_RECORD_FILE);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceEntry>, UploadError> {
        let mut namespaces = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(namespaces),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(identity) = entry
                .file_name()
                .to_str()
                .and_then(UploadIdentity::from_namespace_key)
            else {
                continue;
            };

            if let Some(namespace) = namespace_entry(identity, &entry.path()).await? {
                namespaces.push(namespace);
            }
        }

        Ok(namespaces)
    }

    async fn stat_namespace(&self, identity: &UploadIdentity) -> Result<Option<NamespaceEntry>, UploadError> {
        namespace_entry(identity.clone(), &self.namespace_path(identity)).await
    }
}

/// Describe a namespace directory; `None` if it is gone or not a directory
async fn namespace_entry(identity: UploadIdentity, dir: &Path) -> Result<Option<NamespaceEntry>, UploadError> {
    let metadata = match tokio::fs::metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => metadata,
        Ok(_) => return Ok(None),
        // Removed concurrently
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let completed = tokio::fs::metadata(dir.join(COMPLETION_RECORD_FILE)).await.is_ok();

    Ok(Some(NamespaceEntry {
        identity,
        modified,
        completed,
    }))
}

// ============================================================================
// In-Memory Storage
// ============================================================================

#[derive(Default)]
struct MemoryNamespace {
    chunks: BTreeMap<u64, Arc<[u8]>>,
    completion: Option<CompletionRecord>,
    modified: DateTime<Utc>,
}

/// In-memory chunk storage, for tests and throwaway deployments
#[derive(Default)]
pub struct MemoryChunkStorage {
    namespaces: RwLock<HashMap<UploadIdentity, MemoryNamespace>>,
}

#[async_trait::async_trait]
impl ChunkStorage for MemoryChunkStorage {
    async fn put(&self, identity: &UploadIdentity, index: u64, data: &[u8]) -> Result<(), UploadError> {
        let mut namespaces = self.namespaces.write();
        let namespace = namespaces.entry(identity.clone()).or_default();
        namespace.chunks.insert(index, Arc::from(data));
        namespace.modified = Utc::now();
        Ok(())
    }

    async fn list_indices(&self, identity: &UploadIdentity) -> Result<BTreeSet<u64>, UploadError> {
        Ok(self
            .namespaces
            .read()
            .get(identity)
            .map(|namespace| namespace.chunks.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn exists(&self, identity: &UploadIdentity) -> Result<bool, UploadError> {
        Ok(self.namespaces.read().contains_key(identity))
    }

    async fn open_chunk(&self, identity: &UploadIdentity, index: u64) -> Result<ChunkReader, UploadError> {
        let chunk = self
            .namespaces
            .read()
            .get(identity)
            .and_then(|namespace| namespace.chunks.get(&index).cloned())
            .ok_or_else(|| {
                std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("chunk {} not found", identity.chunk_key(index)),
                )
            })?;
        Ok(Box::new(std::io::Cursor::new(chunk)))
    }

    async fn remove_chunks(&self, identity: &UploadIdentity) -> Result<usize, UploadError> {
        let mut namespaces = self.namespaces.write();
        let Some(namespace) = namespaces.get_mut(identity) else {
            return Ok(0);
        };
        let removed = namespace.chunks.len();
        namespace.chunks.clear();
        if removed > 0 {
            namespace.modified = Utc::now();
        }
        Ok(removed)
    }

    async fn remove_namespace(&self, identity: &UploadIdentity) -> Result<usize, UploadError> {
        Ok(self
            .namespaces
            .write()
            .remove(identity)
            .map(|namespace| namespace.chunks.len())
            .unwrap_or(0))
    }

    async fn write_completion(
        &self,
        identity: &UploadIdentity,
        record: &CompletionRecord,
    ) -> Result<(), UploadError> {
        let mut namespaces = self.namespaces.write();
        let namespace = namespaces.entry(identity.clone()).or_default();
        namespace.completion = Some(record.clone());
        namespace.modified = Utc::now();
        Ok(())
    }

    async fn read_completion(
        &self,
        identity: &UploadIdentity,
    ) -> Result<Option<CompletionRecord>, UploadError> {
        Ok(self
            .namespaces
            .read()
            .get(identity)
            .and_then(|namespace| namespace.completion.clone()))
    }

    async fn clear_completion(&self, identity: &UploadIdentity) -> Result<(), UploadError> {
        if let Some(namespace) = self.namespaces.write().get_mut(identity) {
            namespace.completion = None;
        }
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceEntry>, UploadError> {
        Ok(self
            .namespaces
            .read()
            .iter()
            .map(|(identity, namespace)| NamespaceEntry {
                identity: identity.clone(),
                modified: namespace.modified,
                completed: namespace.completion.is_some(),
            })
            .collect())
    }

    async fn stat_namespace(&self, identity: &UploadIdentity) -> Result<Option<NamespaceEntry>, UploadError> {
        Ok(self.namespaces.read().get(identity).map(|namespace| NamespaceEntry {
            identity: identity.clone(),
            modified: namespace.modified,
            completed: namespace.completion.is_some(),
        }))
    }
}


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn identity() -> UploadIdentity {
        UploadIdentity::new("abc123", 4).unwrap()
    }

    async fn read_chunk(store: &ChunkStore, identity: &UploadIdentity, index: u64) -> Vec<u8> {
        let mut reader = store.open_chunk(identity, index).await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        body
    }

    fn record(total: u64) -> CompletionRecord {
        CompletionRecord {
            total,
            artifact: "movie.mp4".into(),
            size: 12,
            sha256: "00".repeat(32),
            merged_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_local_put_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let identity = identity();

        assert!(!store.exists(&identity).await.unwrap());
        assert!(store.list_indices(&identity).await.unwrap().is_empty());

        store.put(&identity, 10, b"tail").await.unwrap();
        store.put(&identity, 2, b"mid!").await.unwrap();
        store.put(&identity, 0, b"head").await.unwrap();

        assert!(store.exists(&identity).await.unwrap());
        let indices: Vec<u64> = store.list_indices(&identity).await.unwrap().into_iter().collect();
        assert_eq!(indices, vec![0, 2, 10]);

        let chunk_path = temp_dir.path().join("abc123-4").join("abc123-10");
        assert_eq!(std::fs::read(chunk_path).unwrap(), b"tail");
    }

    #[tokio::test]
    async fn test_local_overwrite_replaces_body() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let identity = identity();

        store.put(&identity, 0, b"first").await.unwrap();
        store.put(&identity, 0, b"2nd").await.unwrap();

        assert_eq!(read_chunk(&store, &identity, 0).await, b"2nd");
        assert_eq!(store.list_indices(&identity).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_listing_ignores_temporaries_and_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let identity = identity();

        store.put(&identity, 1, b"data").await.unwrap();
        store.write_completion(&identity, &record(2)).await.unwrap();

        let dir = temp_dir.path().join(identity.namespace_key());
        std::fs::write(dir.join(".abc123-0.deadbeef.part"), b"half").unwrap();
        std::fs::write(dir.join("abc123-007"), b"alias").unwrap();
        std::fs::write(dir.join("notes.txt"), b"junk").unwrap();

        let indices: Vec<u64> = store.list_indices(&identity).await.unwrap().into_iter().collect();
        assert_eq!(indices, vec![1]);
    }

    #[tokio::test]
    async fn test_local_concurrent_puts() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let identity = identity();

        let mut handles = Vec::new();
        for index in 0..32u64 {
            let store = store.clone();
            let identity = identity.clone();
            handles.push(tokio::spawn(async move {
                store.put(&identity, index, &index.to_be_bytes()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let indices = store.list_indices(&identity).await.unwrap();
        assert_eq!(indices, (0..32).collect::<BTreeSet<u64>>());
        assert_eq!(read_chunk(&store, &identity, 17).await, 17u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_local_completion_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let identity = identity();

        assert!(store.read_completion(&identity).await.unwrap().is_none());

        store.put(&identity, 0, b"data").await.unwrap();
        store.put(&identity, 1, b"more").await.unwrap();
        let written = record(2);
        store.write_completion(&identity, &written).await.unwrap();

        assert_eq!(store.remove_chunks(&identity).await.unwrap(), 2);
        assert!(store.list_indices(&identity).await.unwrap().is_empty());
        assert_eq!(store.read_completion(&identity).await.unwrap(), Some(written));

        let namespaces = store.list_namespaces().await.unwrap();
        assert_eq!(namespaces.len(), 1);
        assert!(namespaces[0].completed);
        assert_eq!(namespaces[0].identity, identity);

        store.clear_completion(&identity).await.unwrap();
        assert!(store.read_completion(&identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_remove_namespace() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let identity = identity();

        store.put(&identity, 0, b"data").await.unwrap();
        store.put(&identity, 3, b"data").await.unwrap();

        assert_eq!(store.remove_namespace(&identity).await.unwrap(), 2);
        assert!(!store.exists(&identity).await.unwrap());
        assert_eq!(store.remove_namespace(&identity).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_namespaces_skips_foreign_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        store.put(&identity(), 0, b"data").await.unwrap();
        std::fs::create_dir_all(temp_dir.path().join("not-a-namespace")).unwrap();
        std::fs::write(temp_dir.path().join("stray-12"), b"file").unwrap();

        let namespaces = store.list_namespaces().await.unwrap();
        assert_eq!(namespaces.len(), 1);
        assert!(!namespaces[0].completed);
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let store = ChunkStore::in_memory();
        let identity = identity();

        assert!(!store.exists(&identity).await.unwrap());
        store.put(&identity, 1, b"one").await.unwrap();
        store.put(&identity, 0, b"zero").await.unwrap();
        store.put(&identity, 1, b"uno").await.unwrap();

        assert!(store.exists(&identity).await.unwrap());
        assert_eq!(
            store.list_indices(&identity).await.unwrap(),
            BTreeSet::from([0, 1])
        );
        assert_eq!(read_chunk(&store, &identity, 1).await, b"uno");
        assert!(matches!(
            store.open_chunk(&identity, 9).await,
            Err(UploadError::Io(e)) if e.kind() == ErrorKind::NotFound
        ));

        store.write_completion(&identity, &record(2)).await.unwrap();
        assert_eq!(store.remove_chunks(&identity).await.unwrap(), 2);
        assert!(store.read_completion(&identity).await.unwrap().is_some());
        assert_eq!(store.remove_namespace(&identity).await.unwrap(), 0);
        assert!(!store.exists(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn test_stat_namespace() {
        let temp_dir = TempDir::new().unwrap();
        let local = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let memory = ChunkStore::in_memory();
        let identity = identity();

        for store in [local, memory] {
            assert!(store.stat_namespace(&identity).await.unwrap().is_none());

            let before = Utc::now() - chrono::Duration::seconds(1);
            store.put(&identity, 0, b"data").await.unwrap();
            let entry = store.stat_namespace(&identity).await.unwrap().unwrap();
            assert_eq!(entry.identity, identity);
            assert!(entry.modified >= before);
            assert!(!entry.completed);

            store.write_completion(&identity, &record(1)).await.unwrap();
            assert!(store.stat_namespace(&identity).await.unwrap().unwrap().completed);

            store.remove_namespace(&identity).await.unwrap();
            assert!(store.stat_namespace(&identity).await.unwrap().is_none());
        }
    }
}
