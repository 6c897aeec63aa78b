//! Upload types for the resumable chunk protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default read window used while streaming chunks into an artifact: 64KB
pub const DEFAULT_MERGE_BUFFER_SIZE: usize = 64 * 1024;

/// Default maximum accepted chunk body: 16MB
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;

/// Maximum length of a content hash
pub const MAX_HASH_LEN: usize = 128;

/// Largest accepted chunk total for one upload (about 16TB at 16MB chunks)
pub const MAX_CHUNK_TOTAL: u64 = 1 << 20;

/// Separator between the hash and the chunk size / index in storage keys
pub const KEY_SEPARATOR: char = '-';

// ============================================================================
// Identity
// ============================================================================

/// The (content-hash, chunk-size) pair identifying a logical upload.
///
/// Two clients declaring the same identity are uploading the same file, so
/// every storage location is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadIdentity {
    pub content_hash: String,
    pub chunk_size: u64,
}

impl UploadIdentity {
    /// Create a validated identity
    pub fn new(content_hash: impl Into<String>, chunk_size: u64) -> Result<Self, UploadError> {
        let content_hash = content_hash.into();

        if content_hash.is_empty() {
            return Err(UploadError::InvalidRequest("hash is required".into()));
        }
        if content_hash.len() > MAX_HASH_LEN {
            return Err(UploadError::InvalidRequest(format!(
                "hash longer than {MAX_HASH_LEN} characters"
            )));
        }
        if !content_hash
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(UploadError::InvalidRequest(format!(
                "hash contains unsupported characters: {content_hash}"
            )));
        }
        if chunk_size == 0 {
            return Err(UploadError::InvalidRequest("chunkSize must be positive".into()));
        }

        Ok(Self {
            content_hash,
            chunk_size,
        })
    }

    /// Namespace key: `<hash>-<chunkSize>`
    pub fn namespace_key(&self) -> String {
        format!("{}{}{}", self.content_hash, KEY_SEPARATOR, self.chunk_size)
    }

    /// Chunk key within the namespace: `<hash>-<index>`
    pub fn chunk_key(&self, index: u64) -> String {
        format!("{}{}{}", self.content_hash, KEY_SEPARATOR, index)
    }

    /// Parse a chunk key back into its numeric index.
    ///
    /// Only the canonical decimal form produced by [`chunk_key`](Self::chunk_key)
    /// is accepted, so `hash-007` or `hash-+7` never alias index 7.
    pub fn parse_chunk_key(&self, key: &str) -> Option<u64> {
        let rest = key
            .strip_prefix(self.content_hash.as_str())?
            .strip_prefix(KEY_SEPARATOR)?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let index: u64 = rest.parse().ok()?;
        (index.to_string() == rest).then_some(index)
    }

    /// Recover an identity from a namespace key
    pub fn from_namespace_key(key: &str) -> Option<Self> {
        let (hash, chunk_size) = key.rsplit_once(KEY_SEPARATOR)?;
        let chunk_size: u64 = chunk_size.parse().ok()?;
        Self::new(hash, chunk_size).ok()
    }
}

impl std::fmt::Display for UploadIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.namespace_key())
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// Check request (`hash_check`, websocket `check`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub hash: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub chunk_size: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub total: u64,
}

impl CheckRequest {
    pub fn identity(&self) -> Result<UploadIdentity, UploadError> {
        UploadIdentity::new(self.hash.clone(), self.chunk_size)
    }
}

/// Merge request (`chunks_merge`, websocket `merge`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub hash: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub chunk_size: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub total: u64,
    pub name: String,
}

impl MergeRequest {
    pub fn identity(&self) -> Result<UploadIdentity, UploadError> {
        UploadIdentity::new(self.hash.clone(), self.chunk_size)
    }
}

/// Identity-only request (websocket `subscribe`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRequest {
    pub hash: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub chunk_size: u64,
}

impl IdentityRequest {
    pub fn identity(&self) -> Result<UploadIdentity, UploadError> {
        UploadIdentity::new(self.hash.clone(), self.chunk_size)
    }
}

/// Metadata accompanying one chunk body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub hash: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub chunk_size: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub index: u64,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub total: Option<u64>,
}

impl ChunkHeader {
    pub fn identity(&self) -> Result<UploadIdentity, UploadError> {
        UploadIdentity::new(self.hash.clone(), self.chunk_size)
    }
}

/// Browser form clients send numbers as strings; accept both.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

impl NumberOrString {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::String(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("expected a non-negative integer, got {s:?}"))),
        }
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    NumberOrString::deserialize(deserializer)?.into_u64()
}

fn lenient_opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::String(s)) if s.trim().is_empty() => Ok(None),
        Some(value) => value.into_u64().map(Some),
    }
}

/// Parse a numeric multipart form field
pub fn parse_form_u64(field: &str, value: &str) -> Result<u64, UploadError> {
    value
        .trim()
        .parse()
        .map_err(|_| UploadError::InvalidRequest(format!("{field} must be a non-negative integer")))
}

// ============================================================================
// Result Types
// ============================================================================

/// Upload state of an identity as seen by the resume probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeState {
    /// Nothing stored yet: upload every chunk
    Absent,
    /// Some chunks stored: upload the missing ones
    Partial,
    /// Everything stored (or already merged): skip the upload
    Complete,
}

impl ProbeState {
    /// Numeric code used by the HTTP binding (`data.type`)
    pub fn wire_code(self) -> u8 {
        match self {
            ProbeState::Absent => 0,
            ProbeState::Partial => 1,
            ProbeState::Complete => 2,
        }
    }
}

/// Answer to a check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub state: ProbeState,
    /// Indices currently stored, ascending
    pub present: Vec<u64>,
    /// Indices of `0..total` still needed, ascending
    pub missing: Vec<u64>,
    /// Artifact name when the identity was already merged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// Acknowledgement for a stored chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub index: u64,
    /// False when the identity was already merged and the body was discarded
    pub stored: bool,
    pub size: u64,
}

/// Summary of a finished merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub artifact: String,
    pub size: u64,
    pub sha256: String,
    pub chunks: u64,
    /// True when an earlier merge of the same identity was reused
    pub reused: bool,
}

/// Outcome shape shared by every notification sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub message: String,
}

impl MergeOutcome {
    pub fn success(report: &MergeReport) -> Self {
        let message = if report.reused {
            format!("Merge succeeded, reused existing file {}", report.artifact)
        } else {
            format!("Merge succeeded: {} ({} bytes)", report.artifact, report.size)
        };
        Self {
            success: true,
            message,
        }
    }

    pub fn failure(error: &UploadError) -> Self {
        let message = match error {
            UploadError::Incomplete { .. } => {
                format!("{error}; upload the missing chunks, then merge again")
            }
            UploadError::MergeInProgress(_) => format!("{error}; retry once it finishes"),
            UploadError::Io(_) => format!("Merge failed ({error}); retry the whole merge"),
            _ => error.to_string(),
        };
        Self {
            success: false,
            message,
        }
    }
}

/// Written next to the chunks once an identity has been merged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub total: u64,
    pub artifact: String,
    pub size: u64,
    pub sha256: String,
    pub merged_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Chunk index {index} out of range (total: {total})")]
    IndexOutOfRange { index: u64, total: u64 },

    #[error("Declared total {declared} disagrees with earlier total {previous}")]
    InconsistentTotal { declared: u64, previous: u64 },

    #[error(
        "Chunk set does not match the declared total: {} missing, {} unexpected",
        .missing.len(),
        .unexpected.len()
    )]
    Incomplete {
        missing: Vec<u64>,
        unexpected: Vec<u64>,
    },

    #[error("Merge already in progress for {0}")]
    MergeInProgress(String),

    #[error("Artifact already exists: {0}")]
    ArtifactExists(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::IndexOutOfRange { .. } => StatusCode::BAD_REQUEST,
            Self::InconsistentTotal { .. } => StatusCode::CONFLICT,
            Self::Incomplete { .. } => StatusCode::CONFLICT,
            Self::MergeInProgress(_) => StatusCode::CONFLICT,
            Self::ArtifactExists(_) => StatusCode::CONFLICT,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::IndexOutOfRange { .. } => "INDEX_OUT_OF_RANGE",
            Self::InconsistentTotal { .. } => "INCONSISTENT_TOTAL",
            Self::Incomplete { .. } => "INCOMPLETE",
            Self::MergeInProgress(_) => "MERGE_IN_PROGRESS",
            Self::ArtifactExists(_) => "ARTIFACT_EXISTS",
            Self::Io(_) => "IO_FAILURE",
        }
    }

    /// Whether retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Incomplete { .. } | Self::MergeInProgress(_) | Self::Io(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
