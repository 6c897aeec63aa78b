//! Upload Routes
//!
//! HTTP endpoints for the resumable chunk protocol.
//!
//! Endpoints:
//! - POST /hash_check - Report what is already stored for an identity
//! - POST /chunks_upload - Upload one chunk (multipart form)
//! - POST /chunks_merge - Reassemble all chunks into the named file
//!
//! Every response uses the `{success, msg, data}` envelope.

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use crate::upload::{
    parse_form_u64, BroadcastSink, CheckRequest, FanoutSink, MergeOutcome, MergeReport, MergeRequest,
    NotificationSink, ProbeResult, ProbeState, ResponderSink, UploadError, UploadIdentity,
};

/// Room for multipart boundaries and text fields on top of the chunk body
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

// ============================================================================
// Response Envelope
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub msg: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(msg: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            msg: msg.into(),
            data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckData {
    /// 0 = absent, 1 = partial, 2 = complete
    #[serde(rename = "type")]
    pub kind: u8,
    /// Indices already stored
    pub index: Vec<u64>,
    pub missing: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl From<ProbeResult> for CheckData {
    fn from(result: ProbeResult) -> Self {
        Self {
            kind: result.state.wire_code(),
            index: result.present,
            missing: result.missing,
            artifact: result.artifact,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadData {
    pub index: u64,
    pub stored: bool,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unexpected: Vec<u64>,
}

// ============================================================================
// Error Response
// ============================================================================

fn error_response(error: &UploadError, msg: String) -> Response {
    let status = error.status_code();
    if status.is_server_error() {
        tracing::error!(code = error.code(), error = %error, "Upload request failed");
    } else {
        tracing::debug!(code = error.code(), error = %error, "Upload request rejected");
    }

    let (missing, unexpected) = match error {
        UploadError::Incomplete { missing, unexpected } => (missing.clone(), unexpected.clone()),
        _ => (Vec::new(), Vec::new()),
    };

    let body = Json(ApiResponse {
        success: false,
        msg,
        data: ErrorData {
            code: error.code().to_string(),
            retryable: error.is_retryable(),
            missing,
            unexpected,
        },
    });

    (status, body).into_response()
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let msg = self.to_string();
        error_response(&self, msg)
    }
}

/// A failed merge, answered with the sink's retry guidance
struct MergeFailure {
    error: UploadError,
    outcome: MergeOutcome,
}

impl IntoResponse for MergeFailure {
    fn into_response(self) -> Response {
        error_response(&self.error, self.outcome.message)
    }
}

fn multipart_error(e: MultipartError) -> UploadError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::InvalidRequest("chunk exceeds the maximum accepted size".into())
    } else {
        UploadError::InvalidRequest(e.body_text())
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/hash_check", post(hash_check))
        .route("/chunks_upload", post(chunks_upload))
        .route("/chunks_merge", post(chunks_merge))
        .layer(DefaultBodyLimit::max(max_chunk_bytes + FORM_OVERHEAD_BYTES))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /hash_check
///
/// Tell the client whether to upload everything, resume, or skip.
async fn hash_check(
    State(state): State<AppState>,
    payload: Result<Json<CheckRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<CheckData>>, UploadError> {
    let Json(request) = payload.map_err(|e| UploadError::InvalidRequest(e.body_text()))?;
    let identity = request.identity()?;

    let result = state.uploads().check(&identity, request.total).await?;

    let msg = match result.state {
        ProbeState::Absent => "Check succeeded: upload all chunks",
        ProbeState::Partial => "Check succeeded: upload the missing chunks to resume",
        ProbeState::Complete => "Check succeeded: file already on the server, no upload needed",
    };

    Ok(Json(ApiResponse::ok(msg, CheckData::from(result))))
}

/// Fields collected from a chunk upload form
#[derive(Default)]
struct ChunkForm {
    hash: Option<String>,
    chunk_size: Option<u64>,
    index: Option<u64>,
    total: Option<u64>,
    body: Option<Bytes>,
}

impl ChunkForm {
    async fn read(mut multipart: Multipart) -> Result<Self, UploadError> {
        let mut form = ChunkForm::default();

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();

            if field.file_name().is_some() || name == "file" || name == "chunk" {
                if form.body.is_some() {
                    return Err(UploadError::InvalidRequest("more than one chunk body".into()));
                }
                form.body = Some(field.bytes().await.map_err(multipart_error)?);
                continue;
            }

            let value = field.text().await.map_err(multipart_error)?;
            match name.as_str() {
                "hash" => form.hash = Some(value),
                "chunkSize" => form.chunk_size = Some(parse_form_u64("chunkSize", &value)?),
                "index" => form.index = Some(parse_form_u64("index", &value)?),
                "total" if !value.trim().is_empty() => {
                    form.total = Some(parse_form_u64("total", &value)?)
                }
                // name, size and anything else are informational
                _ => {}
            }
        }

        Ok(form)
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, UploadError> {
    value.ok_or_else(|| UploadError::InvalidRequest(format!("{field} is required")))
}

/// POST /chunks_upload
///
/// Multipart form with `hash`, `chunkSize`, `index`, optional `total` and
/// one file part carrying the chunk body.
async fn chunks_upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ApiResponse<UploadData>>, UploadError> {
    let multipart = multipart.map_err(|e| UploadError::InvalidRequest(e.body_text()))?;
    let form = ChunkForm::read(multipart).await?;

    let identity = UploadIdentity::new(required(form.hash, "hash")?, required(form.chunk_size, "chunkSize")?)?;
    let index = required(form.index, "index")?;
    let body = required(form.body, "file")?;

    if body.len() > state.config().storage.max_chunk_bytes {
        return Err(UploadError::InvalidRequest(format!(
            "chunk of {} bytes exceeds the {} byte limit",
            body.len(),
            state.config().storage.max_chunk_bytes
        )));
    }

    let receipt = state
        .uploads()
        .upload_chunk(&identity, index, &body, form.total)
        .await?;

    let msg = if receipt.stored {
        "Upload succeeded"
    } else {
        "File already merged, chunk not needed"
    };

    Ok(Json(ApiResponse::ok(
        msg,
        UploadData {
            index: receipt.index,
            stored: receipt.stored,
            size: receipt.size,
        },
    )))
}

/// POST /chunks_merge
///
/// Reassemble the file. Websocket subscribers of the identity are notified
/// too.
async fn chunks_merge(
    State(state): State<AppState>,
    payload: Result<Json<MergeRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<MergeReport>>, Response> {
    let Json(request) = payload
        .map_err(|e| UploadError::InvalidRequest(e.body_text()).into_response())?;
    let identity = request.identity().map_err(IntoResponse::into_response)?;

    let (responder, outcome) = ResponderSink::new();
    let broadcaster = BroadcastSink::new(state.events().clone());
    let sinks: Vec<&dyn NotificationSink> = vec![&responder, &broadcaster];
    let sink = FanoutSink::new(sinks);

    let result = state
        .uploads()
        .merge(&identity, request.total, &request.name, &sink)
        .await;
    let outcome = outcome.await.unwrap_or_else(|_| MergeOutcome {
        success: result.is_ok(),
        message: "Merge finished without an outcome; retry the whole merge".into(),
    });

    match result {
        Ok(report) => Ok(Json(ApiResponse {
            success: outcome.success,
            msg: outcome.message,
            data: report,
        })),
        Err(error) => Err(MergeFailure { error, outcome }.into_response()),
    }
}

// ============================================================================
// Tests
// ============================================================================
