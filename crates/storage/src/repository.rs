use async_trait::async_trait;
use exam_core::model::{PaperId, QuestionId, SessionId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::records::{DrillItemRecord, LocalSnapshot, SessionRecord};

/// Errors surfaced by local storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the remote session store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemoteError {
    #[error("authentication required")]
    Unauthorized,

    #[error("session not found")]
    NotFound,

    #[error("session already exists")]
    Conflict,

    #[error("server error (status {status})")]
    Server { status: u16 },

    #[error("request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl RemoteError {
    /// 5xx responses worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Server { .. })
    }

    /// The request never reached the server.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

/// Remote authoritative store for sessions. Snapshot-oriented: every write carries
/// the full record.
#[async_trait]
pub trait SessionRemote: Send + Sync {
    /// # Errors
    ///
    /// Returns `RemoteError::Conflict` if the id already exists, or other remote errors.
    async fn create_session(&self, record: &SessionRecord) -> Result<(), RemoteError>;

    /// # Errors
    ///
    /// Returns `RemoteError::NotFound` if the id is unknown, or other remote errors.
    async fn update_session(&self, record: &SessionRecord) -> Result<(), RemoteError>;

    /// # Errors
    ///
    /// Returns `RemoteError::NotFound` if the id is unknown, or other remote errors.
    async fn fetch_session(&self, id: SessionId) -> Result<SessionRecord, RemoteError>;

    /// Sessions that have not ended yet.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the listing cannot be fetched.
    async fn list_in_progress(&self) -> Result<Vec<SessionRecord>, RemoteError>;

    /// # Errors
    ///
    /// Returns `RemoteError` if the batch is rejected.
    async fn insert_drill_items(&self, items: &[DrillItemRecord]) -> Result<(), RemoteError>;
}

/// Local full-state cache keyed by session id, used to survive reloads and crashes.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Store a snapshot unless a newer revision is already cached.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the snapshot cannot be stored.
    async fn save_snapshot(&self, snapshot: &LocalSnapshot) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn load_snapshot(&self, id: SessionId) -> Result<LocalSnapshot, StorageError>;

    /// Delete a snapshot. Deleting a missing entry is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete fails.
    async fn delete_snapshot(&self, id: SessionId) -> Result<(), StorageError>;

    /// Ids of every cached session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the listing fails.
    async fn list_snapshots(&self) -> Result<Vec<SessionId>, StorageError>;
}

/// A question as published by the question bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionRecord {
    pub id: QuestionId,
    pub number: u32,
    pub part_id: String,
    pub part_name: String,
    pub correct_choice: Option<String>,
}

/// Source of ordered question records for a paper.
#[async_trait]
pub trait QuestionBank: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for an unknown paper, or other storage errors.
    async fn questions_for_paper(&self, paper_id: &PaperId) -> Result<Vec<QuestionRecord>, StorageError>;
}

//
// ─── IN-MEMORY ADAPTERS ────────────────────────────────────────────────────────
//

fn lock_err<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

/// Simple in-memory cache implementation for testing and offline use.
#[derive(Clone, Default)]
pub struct InMemoryLocalCache {
    snapshots: Arc<Mutex<HashMap<SessionId, LocalSnapshot>>>,
}

impl InMemoryLocalCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalCache for InMemoryLocalCache {
    async fn save_snapshot(&self, snapshot: &LocalSnapshot) -> Result<(), StorageError> {
        let mut guard = self.snapshots.lock().map_err(lock_err)?;
        let newer_cached = guard
            .get(&snapshot.session_id())
            .is_some_and(|existing| existing.revision() > snapshot.revision());
        if !newer_cached {
            guard.insert(snapshot.session_id(), snapshot.clone());
        }
        Ok(())
    }

    async fn load_snapshot(&self, id: SessionId) -> Result<LocalSnapshot, StorageError> {
        let guard = self.snapshots.lock().map_err(lock_err)?;
        guard.get(&id).cloned().ok_or(StorageError::NotFound)
    }

    async fn delete_snapshot(&self, id: SessionId) -> Result<(), StorageError> {
        let mut guard = self.snapshots.lock().map_err(lock_err)?;
        guard.remove(&id);
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<SessionId>, StorageError> {
        let guard = self.snapshots.lock().map_err(lock_err)?;
        let mut ids: Vec<SessionId> = guard.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// A call observed by `InMemorySessionRemote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Create { id: SessionId, revision: u64 },
    Update { id: SessionId, revision: u64 },
    Fetch(SessionId),
    ListInProgress,
    InsertDrillItems(usize),
}

/// In-memory remote with scripted failures, for tests and offline runs.
///
/// Failures queued with `fail_next` apply to create/update writes in order; a sticky
/// failure set with `fail_always` applies to every write until cleared.
#[derive(Clone, Default)]
pub struct InMemorySessionRemote {
    sessions: Arc<Mutex<HashMap<SessionId, SessionRecord>>>,
    drill_items: Arc<Mutex<Vec<DrillItemRecord>>>,
    write_failures: Arc<Mutex<VecDeque<RemoteError>>>,
    sticky_failure: Arc<Mutex<Option<RemoteError>>>,
    drill_failures: Arc<Mutex<VecDeque<RemoteError>>>,
    calls: Arc<Mutex<Vec<RemoteCall>>>,
}

impl InMemorySessionRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next create/update with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        if let Ok(mut guard) = self.write_failures.lock() {
            guard.push_back(error);
        }
    }

    /// Fail every create/update with `error` until `None` is set.
    pub fn fail_always(&self, error: Option<RemoteError>) {
        if let Ok(mut guard) = self.sticky_failure.lock() {
            *guard = error;
        }
    }

    pub fn fail_next_drill(&self, error: RemoteError) {
        if let Ok(mut guard) = self.drill_failures.lock() {
            guard.push_back(error);
        }
    }

    /// Seed or overwrite a stored record without recording a call.
    pub fn insert(&self, record: SessionRecord) {
        if let Ok(mut guard) = self.sessions.lock() {
            guard.insert(record.id, record);
        }
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<SessionRecord> {
        self.sessions.lock().ok()?.get(&id).cloned()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of create/update calls received, failed ones included.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RemoteCall::Create { .. } | RemoteCall::Update { .. }))
            .count()
    }

    #[must_use]
    pub fn drill_items(&self) -> Vec<DrillItemRecord> {
        self.drill_items.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn record_call(&self, call: RemoteCall) {
        if let Ok(mut guard) = self.calls.lock() {
            guard.push(call);
        }
    }

    fn scripted_write_failure(&self) -> Option<RemoteError> {
        if let Some(err) = self.write_failures.lock().ok()?.pop_front() {
            return Some(err);
        }
        self.sticky_failure.lock().ok()?.clone()
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, SessionRecord>>, RemoteError> {
        self.sessions
            .lock()
            .map_err(|e| RemoteError::Network(e.to_string()))
    }
}

#[async_trait]
impl SessionRemote for InMemorySessionRemote {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
        self.record_call(RemoteCall::Create {
            id: record.id,
            revision: record.revision,
        });
        if let Some(err) = self.scripted_write_failure() {
            return Err(err);
        }
        let mut guard = self.sessions()?;
        if guard.contains_key(&record.id) {
            return Err(RemoteError::Conflict);
        }
        guard.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
        self.record_call(RemoteCall::Update {
            id: record.id,
            revision: record.revision,
        });
        if let Some(err) = self.scripted_write_failure() {
            return Err(err);
        }
        let mut guard = self.sessions()?;
        match guard.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RemoteError::NotFound),
        }
    }

    async fn fetch_session(&self, id: SessionId) -> Result<SessionRecord, RemoteError> {
        self.record_call(RemoteCall::Fetch(id));
        self.sessions()?.get(&id).cloned().ok_or(RemoteError::NotFound)
    }

    async fn list_in_progress(&self) -> Result<Vec<SessionRecord>, RemoteError> {
        self.record_call(RemoteCall::ListInProgress);
        let mut open: Vec<SessionRecord> = self
            .sessions()?
            .values()
            .filter(|r| !r.is_ended())
            .cloned()
            .collect();
        open.sort_by_key(|r| r.started_at);
        Ok(open)
    }

    async fn insert_drill_items(&self, items: &[DrillItemRecord]) -> Result<(), RemoteError> {
        self.record_call(RemoteCall::InsertDrillItems(items.len()));
        let scripted = self.drill_failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        let mut guard = self
            .drill_items
            .lock()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        guard.extend_from_slice(items);
        Ok(())
    }
}

/// Fixed question bank keyed by paper, for tests and offline runs.
#[derive(Clone, Default)]
pub struct InMemoryQuestionBank {
    papers: Arc<Mutex<HashMap<PaperId, Vec<QuestionRecord>>>>,
}

impl InMemoryQuestionBank {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_paper(&self, paper_id: PaperId, questions: Vec<QuestionRecord>) {
        if let Ok(mut guard) = self.papers.lock() {
            guard.insert(paper_id, questions);
        }
    }
}

#[async_trait]
impl QuestionBank for InMemoryQuestionBank {
    async fn questions_for_paper(&self, paper_id: &PaperId) -> Result<Vec<QuestionRecord>, StorageError> {
        let guard = self.papers.lock().map_err(lock_err)?;
        let mut questions = guard.get(paper_id).cloned().ok_or(StorageError::NotFound)?;
        questions.sort_by_key(|q| q.number);
        Ok(questions)
    }
}

/// Aggregates the local cache behind a trait object for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub cache: Arc<dyn LocalCache>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let cache: Arc<dyn LocalCache> = Arc::new(InMemoryLocalCache::new());
        Self { cache }
    }
}
