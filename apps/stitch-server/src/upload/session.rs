//! Upload Session Registry
//!
//! Tracks per-identity coordination state:
//! - The declared chunk total, so conflicting totals are rejected
//! - A gate that lets chunk writes run concurrently but excludes them while a
//!   merge (or cleanup) holds the identity
//! - Last activity, so idle entries can be dropped
//!
//! Chunk presence itself is never cached here; the chunk store is the source
//! of truth and is re-read on every check and merge.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::types::{ProbeState, UploadError, UploadIdentity, MAX_CHUNK_TOTAL};

// ============================================================================
// Upload Session (derived view)
// ============================================================================

/// Snapshot of an identity's stored chunks against a declared total
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub identity: UploadIdentity,
    pub declared_total: u64,
    pub present: BTreeSet<u64>,
}

impl UploadSession {
    pub fn new(identity: UploadIdentity, declared_total: u64, present: BTreeSet<u64>) -> Self {
        Self {
            identity,
            declared_total,
            present,
        }
    }

    /// True iff the stored index set is exactly `{0, .., total-1}`
    pub fn is_complete(&self) -> bool {
        let total = self.declared_total;
        total > 0
            && self.present.len() as u64 == total
            && self.present.last() == Some(&(total - 1))
    }

    /// Indices of `0..total` not yet stored
    pub fn missing(&self) -> Vec<u64> {
        (0..self.declared_total)
            .filter(|index| !self.present.contains(index))
            .collect()
    }

    /// Stored indices at or beyond the declared total
    pub fn unexpected(&self) -> Vec<u64> {
        self.present.range(self.declared_total..).copied().collect()
    }

    /// State of an existing namespace. Zero stored chunks is still partial;
    /// only a missing namespace is absent.
    pub fn state(&self) -> ProbeState {
        if self.is_complete() {
            ProbeState::Complete
        } else {
            ProbeState::Partial
        }
    }
}

// ============================================================================
// Session Registry
// ============================================================================

/// Per-identity coordination shared by uploads, merges and the reaper
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

#[derive(Default)]
struct SessionRegistryInner {
    entries: Mutex<HashMap<UploadIdentity, Arc<SessionEntry>>>,
}

struct SessionEntry {
    declared_total: Mutex<Option<u64>>,
    /// Set while a merge or cleanup owns the identity
    exclusive: AtomicBool,
    gate: Arc<RwLock<()>>,
    last_activity: Mutex<DateTime<Utc>>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            declared_total: Mutex::new(None),
            exclusive: AtomicBool::new(false),
            gate: Arc::new(RwLock::new(())),
            last_activity: Mutex::new(Utc::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }
}

/// Held while a chunk is being written
pub struct UploadPermit {
    _gate: OwnedRwLockReadGuard<()>,
}

/// Held for the whole duration of a merge or cleanup.
///
/// Dropping the guard (including when the owning future is cancelled while
/// still waiting for in-flight uploads) releases the identity.
pub struct ExclusiveGuard {
    entry: Arc<SessionEntry>,
    _gate: Option<OwnedRwLockWriteGuard<()>>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.entry.exclusive.store(false, Ordering::Release);
        self.entry.touch();
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, identity: &UploadIdentity) -> Arc<SessionEntry> {
        self.inner
            .entries
            .lock()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(SessionEntry::new()))
            .clone()
    }

    /// Record the total declared by a caller.
    ///
    /// The first declaration wins; a later, different total is rejected.
    pub fn declare_total(&self, identity: &UploadIdentity, total: u64) -> Result<(), UploadError> {
        if total == 0 {
            return Err(UploadError::InvalidRequest("total must be positive".into()));
        }
        if total > MAX_CHUNK_TOTAL {
            return Err(UploadError::InvalidRequest(format!(
                "total {total} exceeds the limit of {MAX_CHUNK_TOTAL} chunks"
            )));
        }

        let entry = self.entry(identity);
        entry.touch();

        let mut declared = entry.declared_total.lock();
        match *declared {
            Some(previous) if previous != total => Err(UploadError::InconsistentTotal {
                declared: total,
                previous,
            }),
            Some(_) => Ok(()),
            None => {
                *declared = Some(total);
                Ok(())
            }
        }
    }

    pub fn declared_total(&self, identity: &UploadIdentity) -> Option<u64> {
        self.inner
            .entries
            .lock()
            .get(identity)
            .and_then(|entry| *entry.declared_total.lock())
    }

    /// Admit one chunk write. Refused while a merge holds the identity.
    pub async fn begin_upload(&self, identity: &UploadIdentity) -> Result<UploadPermit, UploadError> {
        let entry = self.entry(identity);
        if entry.exclusive.load(Ordering::Acquire) {
            return Err(UploadError::MergeInProgress(identity.to_string()));
        }

        let gate = entry.gate.clone().read_owned().await;

        // A merge may have started while we queued
        if entry.exclusive.load(Ordering::Acquire) {
            return Err(UploadError::MergeInProgress(identity.to_string()));
        }

        entry.touch();
        Ok(UploadPermit { _gate: gate })
    }

    /// Take the identity exclusively, waiting for in-flight chunk writes.
    ///
    /// Only one holder at a time: a second caller gets `MergeInProgress`
    /// instead of queueing.
    pub async fn begin_exclusive(&self, identity: &UploadIdentity) -> Result<ExclusiveGuard, UploadError> {
        let entry = self.entry(identity);
        if entry
            .exclusive
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UploadError::MergeInProgress(identity.to_string()));
        }

        let mut guard = ExclusiveGuard {
            entry: entry.clone(),
            _gate: None,
        };
        guard._gate = Some(entry.gate.clone().write_owned().await);
        Ok(guard)
    }

    #[cfg(test)]
    fn is_exclusive(&self, identity: &UploadIdentity) -> bool {
        self.inner
            .entries
            .lock()
            .get(identity)
            .map(|entry| entry.exclusive.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Drop everything known about an identity, unless it is in use.
    ///
    /// Returns whether the entry was removed.
    pub fn forget(&self, identity: &UploadIdentity) -> bool {
        let mut entries = self.inner.entries.lock();
        let idle = entries
            .get(identity)
            .map(|entry| Arc::strong_count(entry) == 1 && !entry.exclusive.load(Ordering::Acquire))
            .unwrap_or(false);
        if idle {
            entries.remove(identity);
        }
        idle
    }

    /// Drop entries idle since `cutoff` that nobody is using.
    ///
    /// Returns the number of entries removed.
    pub fn forget_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            Arc::strong_count(entry) > 1
                || entry.exclusive.load(Ordering::Acquire)
                || *entry.last_activity.lock() >= cutoff
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity() -> UploadIdentity {
        UploadIdentity::new("abc123", 1024).unwrap()
    }

    #[test]
    fn test_session_completeness() {
        let id = identity();

        let complete = UploadSession::new(id.clone(), 3, [0, 1, 2].into());
        assert!(complete.is_complete());
        assert_eq!(complete.state(), ProbeState::Complete);
        assert!(complete.missing().is_empty());

        let partial = UploadSession::new(id.clone(), 4, [1, 3].into());
        assert!(!partial.is_complete());
        assert_eq!(partial.state(), ProbeState::Partial);
        assert_eq!(partial.missing(), vec![0, 2]);

        let empty = UploadSession::new(id.clone(), 2, BTreeSet::new());
        assert_eq!(empty.state(), ProbeState::Partial);
        assert_eq!(empty.missing(), vec![0, 1]);
    }

    #[test]
    fn test_count_match_is_not_completeness() {
        // Same number of chunks, wrong indices
        let session = UploadSession::new(identity(), 3, [0, 1, 5].into());
        assert!(!session.is_complete());
        assert_eq!(session.missing(), vec![2]);
        assert_eq!(session.unexpected(), vec![5]);

        // Everything present plus a stray index
        let session = UploadSession::new(identity(), 2, [0, 1, 2].into());
        assert!(!session.is_complete());
        assert!(session.missing().is_empty());
        assert_eq!(session.unexpected(), vec![2]);
    }

    #[test]
    fn test_declare_total() {
        let registry = SessionRegistry::new();
        let id = identity();

        assert_eq!(registry.declared_total(&id), None);
        registry.declare_total(&id, 3).unwrap();
        registry.declare_total(&id, 3).unwrap();
        assert_eq!(registry.declared_total(&id), Some(3));

        assert!(matches!(
            registry.declare_total(&id, 4),
            Err(UploadError::InconsistentTotal { declared: 4, previous: 3 })
        ));
        assert!(matches!(
            registry.declare_total(&id, 0),
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_declare_total_is_bounded() {
        let registry = SessionRegistry::new();
        let id = identity();

        assert!(matches!(
            registry.declare_total(&id, MAX_CHUNK_TOTAL + 1),
            Err(UploadError::InvalidRequest(_))
        ));
        assert_eq!(registry.declared_total(&id), None);
        assert!(registry.declare_total(&id, MAX_CHUNK_TOTAL).is_ok());
    }

    #[tokio::test]
    async fn test_exclusive_is_single_holder() {
        let registry = SessionRegistry::new();
        let id = identity();

        let guard = registry.begin_exclusive(&id).await.unwrap();
        assert!(registry.is_exclusive(&id));
        assert!(matches!(
            registry.begin_exclusive(&id).await,
            Err(UploadError::MergeInProgress(_))
        ));
        assert!(matches!(
            registry.begin_upload(&id).await,
            Err(UploadError::MergeInProgress(_))
        ));

        drop(guard);
        assert!(!registry.is_exclusive(&id));
        assert!(registry.begin_upload(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_uploads() {
        let registry = SessionRegistry::new();
        let id = identity();

        let permit = registry.begin_upload(&id).await.unwrap();

        let task = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.begin_exclusive(&id).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert!(matches!(
            registry.begin_upload(&id).await,
            Err(UploadError::MergeInProgress(_))
        ));

        drop(permit);
        task.await.unwrap().unwrap();
        assert!(!registry.is_exclusive(&id));
    }

    #[tokio::test]
    async fn test_cancelled_exclusive_releases_identity() {
        let registry = SessionRegistry::new();
        let id = identity();

        let permit = registry.begin_upload(&id).await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(20), registry.begin_exclusive(&id)).await;
        assert!(waiting.is_err());

        assert!(!registry.is_exclusive(&id));
        drop(permit);
        assert!(registry.begin_exclusive(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_forget_idle() {
        let registry = SessionRegistry::new();
        let id = identity();
        let other = UploadIdentity::new("def456", 1024).unwrap();

        registry.declare_total(&id, 2).unwrap();
        registry.declare_total(&other, 2).unwrap();
        let guard = registry.begin_exclusive(&other).await.unwrap();

        let removed = registry.forget_idle(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert_eq!(registry.declared_total(&id), None);
        assert_eq!(registry.declared_total(&other), Some(2));

        assert!(!registry.forget(&other));
        drop(guard);
        assert!(registry.forget(&other));
        assert!(registry.is_empty());
    }
}
