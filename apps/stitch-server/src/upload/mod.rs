//! Resumable Chunked Upload Module
//!
//! Implements content-addressed, resumable uploads of large files:
//! - Chunks are keyed by (content hash, chunk size) so identical uploads share storage
//! - Clients probe what is already stored and upload only the missing chunks
//! - The merge engine streams chunks in index order into the final artifact
//!
//! Protocol Flow:
//! 1. Client sends `check` with hash, chunk size and chunk total
//! 2. Server answers absent / partial (with present indices) / complete
//! 3. Client uploads the missing chunks, in any order and in parallel
//! 4. Client sends `merge`; server reassembles and reports the outcome

pub mod artifact;
pub mod chunk_store;
pub mod merge;
pub mod notify;
pub mod probe;
pub mod reaper;
pub mod service;
pub mod session;
pub mod types;

pub use artifact::ArtifactStore;
pub use chunk_store::{ChunkStorage, ChunkStore, LocalChunkStorage, MemoryChunkStorage};
pub use merge::{MergeEngine, MergeOptions};
pub use notify::{BroadcastSink, FanoutSink, NotificationSink, ResponderSink};
pub use probe::ResumeProbe;
pub use reaper::{ChunkReaper, ReapStats};
pub use service::UploadService;
pub use session::{SessionRegistry, UploadSession};
pub use types::*;
