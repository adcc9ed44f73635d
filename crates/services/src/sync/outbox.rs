use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use exam_core::model::SessionId;
use storage::SessionRecord;

/// A remote write that failed and waits for the next sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceTask {
    pub payload: SessionRecord,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PersistenceTask {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.payload.id
    }
}

/// Tasks that are due for replay, and how many were discarded.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub ready: Vec<PersistenceTask>,
    pub expired: usize,
    pub exhausted: usize,
    pub superseded: usize,
}

/// In-memory FIFO of failed remote writes.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    tasks: Mutex<Vec<PersistenceTask>>,
}

impl Outbox {
    fn guard(&self) -> MutexGuard<'_, Vec<PersistenceTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, task: PersistenceTask) {
        self.guard().push(task);
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn tasks(&self) -> Vec<PersistenceTask> {
        self.guard().clone()
    }

    /// Drop every queued write for `id`. Returns how many were removed.
    pub fn clear_session(&self, id: SessionId) -> usize {
        self.take_session(id).len()
    }

    /// Remove and return every queued write for `id`, oldest first.
    pub fn take_session(&self, id: SessionId) -> Vec<PersistenceTask> {
        let mut tasks = self.guard();
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *tasks)
            .into_iter()
            .partition(|task| task.session_id() == id);
        *tasks = kept;
        taken
    }

    /// Take everything out of the queue, keeping only the newest live write per session.
    pub fn drain(&self, now: DateTime<Utc>, max_age: Duration, max_retries: u32) -> Drained {
        let taken = std::mem::take(&mut *self.guard());
        let mut drained = Drained::default();
        let mut newest: HashMap<SessionId, PersistenceTask> = HashMap::new();

        for task in taken {
            if now - task.enqueued_at > max_age {
                drained.expired += 1;
                continue;
            }
            if task.retry_count >= max_retries {
                drained.exhausted += 1;
                continue;
            }
            match newest.get(&task.session_id()) {
                Some(kept) if kept.payload.revision > task.payload.revision => {
                    drained.superseded += 1;
                }
                Some(_) => {
                    drained.superseded += 1;
                    newest.insert(task.session_id(), task);
                }
                None => {
                    newest.insert(task.session_id(), task);
                }
            }
        }

        drained.ready = newest.into_values().collect();
        drained.ready.sort_by_key(|task| task.enqueued_at);
        drained
    }
}
