//! Merge notifications
//!
//! A merge reports progress and exactly one final outcome to a sink. The
//! HTTP binding answers its own request; websocket subscribers hear about
//! every merge of an identity no matter who started it.

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::types::{MergeOutcome, MergeReport, UploadIdentity};
use crate::events::{DoneEvent, EventHub, ProgressEvent, ServerEvent};

/// Receiver of merge progress and outcome
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    /// `merged` of `total` chunks have been appended
    async fn progress(&self, _identity: &UploadIdentity, _merged: u64, _total: u64) {}

    /// Final outcome. Called once per merge.
    async fn finish(&self, identity: &UploadIdentity, outcome: &MergeOutcome, report: Option<&MergeReport>);
}

// ============================================================================
// Responder
// ============================================================================

/// Hands the outcome back to the request that started the merge
pub struct ResponderSink {
    tx: Mutex<Option<oneshot::Sender<MergeOutcome>>>,
}

impl ResponderSink {
    pub fn new() -> (Self, oneshot::Receiver<MergeOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait::async_trait]
impl NotificationSink for ResponderSink {
    async fn finish(&self, _identity: &UploadIdentity, outcome: &MergeOutcome, _report: Option<&MergeReport>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome.clone());
        }
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Publishes progress and outcome to the identity's subscribers
#[derive(Clone)]
pub struct BroadcastSink {
    hub: EventHub,
}

impl BroadcastSink {
    pub fn new(hub: EventHub) -> Self {
        Self { hub }
    }
}

#[async_trait::async_trait]
impl NotificationSink for BroadcastSink {
    async fn progress(&self, identity: &UploadIdentity, merged: u64, total: u64) {
        self.hub.publish(
            identity,
            ServerEvent::Progress(ProgressEvent {
                hash: identity.content_hash.clone(),
                chunk_size: identity.chunk_size,
                merged,
                total,
            }),
        );
    }

    async fn finish(&self, identity: &UploadIdentity, outcome: &MergeOutcome, report: Option<&MergeReport>) {
        let delivered = self
            .hub
            .publish(identity, ServerEvent::Done(DoneEvent::new(identity, outcome, report)));

        tracing::debug!(
            identity = %identity,
            success = outcome.success,
            subscribers = delivered,
            "Broadcast merge outcome"
        );
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// Forwards every notification to each inner sink in order
pub struct FanoutSink<'a> {
    sinks: Vec<&'a dyn NotificationSink>,
}

impl<'a> FanoutSink<'a> {
    pub fn new(sinks: Vec<&'a dyn NotificationSink>) -> Self {
        Self { sinks }
    }
}

#[async_trait::async_trait]
impl<'a> NotificationSink for FanoutSink<'a> {
    async fn progress(&self, identity: &UploadIdentity, merged: u64, total: u64) {
        for sink in &self.sinks {
            sink.progress(identity, merged, total).await;
        }
    }

    async fn finish(&self, identity: &UploadIdentity, outcome: &MergeOutcome, report: Option<&MergeReport>) {
        for sink in &self.sinks {
            sink.finish(identity, outcome, report).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
