//! Event Hub
//!
//! Fan-out of upload events to websocket subscribers. Each upload identity
//! gets its own broadcast channel, keyed by `<hash>-<chunkSize>`, created on
//! first subscription and dropped once nobody listens.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::upload::{MergeOutcome, MergeReport, ProbeResult, ProbeState, UploadError, UploadIdentity, UploadReceipt};

/// Buffered events per identity before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Events
// ============================================================================

/// Server-to-client message, serialized as `{"event": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Checked(CheckedEvent),
    Uploaded(UploadedEvent),
    Progress(ProgressEvent),
    Done(DoneEvent),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckedEvent {
    pub hash: String,
    pub chunk_size: u64,
    pub state: ProbeState,
    /// Same numeric code as the HTTP `data.type`
    #[serde(rename = "type")]
    pub kind: u8,
    pub present: Vec<u64>,
    pub missing: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl CheckedEvent {
    pub fn new(identity: &UploadIdentity, result: ProbeResult) -> Self {
        Self {
            hash: identity.content_hash.clone(),
            chunk_size: identity.chunk_size,
            state: result.state,
            kind: result.state.wire_code(),
            present: result.present,
            missing: result.missing,
            artifact: result.artifact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedEvent {
    pub hash: String,
    pub chunk_size: u64,
    pub index: u64,
    pub stored: bool,
}

impl UploadedEvent {
    pub fn new(identity: &UploadIdentity, receipt: &UploadReceipt) -> Self {
        Self {
            hash: identity.content_hash.clone(),
            chunk_size: identity.chunk_size,
            index: receipt.index,
            stored: receipt.stored,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub hash: String,
    pub chunk_size: u64,
    /// Chunks appended to the artifact so far
    pub merged: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneEvent {
    pub hash: String,
    pub chunk_size: u64,
    pub success: bool,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl DoneEvent {
    pub fn new(identity: &UploadIdentity, outcome: &MergeOutcome, report: Option<&MergeReport>) -> Self {
        Self {
            hash: identity.content_hash.clone(),
            chunk_size: identity.chunk_size,
            success: outcome.success,
            msg: outcome.message.clone(),
            artifact: report.map(|r| r.artifact.clone()),
            size: report.map(|r| r.size),
            sha256: report.map(|r| r.sha256.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub code: String,
    pub msg: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl ErrorEvent {
    pub fn from_error(error: &UploadError) -> Self {
        Self {
            code: error.code().to_string(),
            msg: error.to_string(),
            retryable: error.is_retryable(),
            hash: None,
            chunk_size: None,
            index: None,
        }
    }

    pub fn for_identity(mut self, identity: &UploadIdentity) -> Self {
        self.hash = Some(identity.content_hash.clone());
        self.chunk_size = Some(identity.chunk_size);
        self
    }

    pub fn for_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Per-identity broadcast channels
#[derive(Clone, Default)]
pub struct EventHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<ServerEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event published for an identity
    pub fn subscribe(&self, identity: &UploadIdentity) -> broadcast::Receiver<ServerEvent> {
        self.channels
            .lock()
            .entry(identity.namespace_key())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to an identity's subscribers.
    ///
    /// Returns how many subscribers received the event.
    pub fn publish(&self, identity: &UploadIdentity, event: ServerEvent) -> usize {
        let key = identity.namespace_key();
        let mut channels = self.channels.lock();

        let Some(sender) = channels.get(&key) else {
            return 0;
        };

        match sender.send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                channels.remove(&key);
                tracing::trace!(channel = %key, "Dropped channel without subscribers");
                0
            }
        }
    }

    /// Drop channels whose subscribers have all gone away
    pub fn prune(&self) -> usize {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
