//! Artifact Store
//!
//! Output namespace for merged files. Artifacts are streamed into a hidden
//! partial file and published under their final name in one step, so a
//! reader never observes a half-written artifact.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::types::UploadError;

/// Longest accepted artifact name, in bytes
pub const MAX_ARTIFACT_NAME_LEN: usize = 255;

/// Directory of merged artifacts
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a client-supplied artifact name.
    ///
    /// The name must be a single plain file name that stays inside the
    /// output directory and does not collide with partial files.
    pub fn validate_name(name: &str) -> Result<(), UploadError> {
        if name.is_empty() {
            return Err(UploadError::InvalidRequest("name is required".into()));
        }
        if name.len() > MAX_ARTIFACT_NAME_LEN {
            return Err(UploadError::InvalidRequest(format!(
                "name longer than {MAX_ARTIFACT_NAME_LEN} bytes"
            )));
        }
        if name.starts_with('.') {
            return Err(UploadError::InvalidRequest(format!(
                "hidden names not allowed: {name}"
            )));
        }
        if name.contains(['/', '\\', '\0']) {
            return Err(UploadError::InvalidRequest(format!(
                "name must not contain path separators: {name}"
            )));
        }

        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(()),
            _ => Err(UploadError::InvalidRequest(format!(
                "name must be a plain file name: {name}"
            ))),
        }
    }

    /// Final location of an artifact
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn exists(&self, name: &str) -> Result<bool, UploadError> {
        match tokio::fs::metadata(self.path(name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a published artifact; a missing one is not an error
    pub async fn remove(&self, name: &str) -> Result<(), UploadError> {
        Self::validate_name(name)?;
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Start writing a new artifact
    pub async fn begin(&self, name: &str) -> Result<PartialArtifact, UploadError> {
        Self::validate_name(name)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let temp_path = self.root.join(format!(".{}.{}.partial", name, Uuid::new_v4()));
        let file = File::create(&temp_path).await?;

        Ok(PartialArtifact {
            name: name.to_string(),
            file,
            temp_path,
            final_path: self.path(name),
            committed: false,
        })
    }

    /// Publish a byte-identical copy of an existing artifact under another name
    pub async fn copy(&self, from: &str, to: &str) -> Result<u64, UploadError> {
        Self::validate_name(from)?;
        let mut source = File::open(self.path(from)).await?;
        let mut partial = self.begin(to).await?;
        let copied = tokio::io::copy(&mut source, partial.file_mut()).await?;
        partial.commit().await?;

        tracing::info!(from = %from, to = %to, size = copied, "Copied artifact");

        Ok(copied)
    }
}

/// An artifact being written. Removed on drop unless committed.
pub struct PartialArtifact {
    name: String,
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl PartialArtifact {
    #[cfg(test)]
    fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Flush, then publish under the final name.
    ///
    /// Never replaces an existing artifact: if the name was taken meanwhile,
    /// this fails with `ArtifactExists` and the partial file is discarded.
    pub async fn commit(mut self) -> Result<(), UploadError> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        match tokio::fs::hard_link(&self.temp_path, &self.final_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(UploadError::ArtifactExists(self.name.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        self.committed = true;

        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await {
            tracing::warn!(
                path = %self.temp_path.display(),
                error = %e,
                "Failed to remove partial artifact after publishing"
            );
        }

        Ok(())
    }
}

impl Drop for PartialArtifact {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_name() {
        assert!(ArtifactStore::validate_name("movie.mp4").is_ok());
        assert!(ArtifactStore::validate_name("report 2024 (final).pdf").is_ok());

        assert!(ArtifactStore::validate_name("").is_err());
        assert!(ArtifactStore::validate_name("..").is_err());
        assert!(ArtifactStore::validate_name(".").is_err());
        assert!(ArtifactStore::validate_name(".hidden").is_err());
        assert!(ArtifactStore::validate_name("../escape").is_err());
        assert!(ArtifactStore::validate_name("dir/file").is_err());
        assert!(ArtifactStore::validate_name("dir\\file").is_err());
        assert!(ArtifactStore::validate_name("/etc/passwd").is_err());
        assert!(ArtifactStore::validate_name(&"a".repeat(MAX_ARTIFACT_NAME_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_commit_publishes() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().join("files"));

        let mut partial = store.begin("hello.txt").await.unwrap();
        partial.file_mut().write_all(b"hello world").await.unwrap();
        let temp_path = partial.temp_path().to_path_buf();
        assert!(temp_path.exists());
        assert!(!store.exists("hello.txt").await.unwrap());

        partial.commit().await.unwrap();

        assert!(store.exists("hello.txt").await.unwrap());
        assert!(!temp_path.exists());
        assert_eq!(std::fs::read(store.path("hello.txt")).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_drop_discards_partial() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());

        let mut partial = store.begin("broken.bin").await.unwrap();
        partial.file_mut().write_all(b"half").await.unwrap();
        let temp_path = partial.temp_path().to_path_buf();
        drop(partial);

        assert!(!temp_path.exists());
        assert!(!store.exists("broken.bin").await.unwrap());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_commit_never_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());
        std::fs::write(store.path("taken.bin"), b"original").unwrap();

        let mut partial = store.begin("taken.bin").await.unwrap();
        partial.file_mut().write_all(b"intruder").await.unwrap();
        let result = partial.commit().await;

        assert!(matches!(result, Err(UploadError::ArtifactExists(name)) if name == "taken.bin"));
        assert_eq!(std::fs::read(store.path("taken.bin")).unwrap(), b"original");
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_copy() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());
        std::fs::write(store.path("a.bin"), b"payload").unwrap();

        assert_eq!(store.copy("a.bin", "b.bin").await.unwrap(), 7);
        assert_eq!(std::fs::read(store.path("b.bin")).unwrap(), b"payload");

        assert!(matches!(
            store.copy("a.bin", "b.bin").await,
            Err(UploadError::ArtifactExists(_))
        ));
    }

    #[tokio::test]
    async fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());
        std::fs::write(store.path("old.bin"), b"payload").unwrap();

        store.remove("old.bin").await.unwrap();
        assert!(!store.exists("old.bin").await.unwrap());
        store.remove("old.bin").await.unwrap();
        assert!(store.remove("../old.bin").await.is_err());
    }
}
