use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use exam_core::Clock;
use exam_core::model::{PaperId, SessionId};
use storage::{LocalCache, LocalSnapshot, RemoteError, SessionRecord, SessionRemote, StorageError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use super::drill::derive_drill_items;
use super::outbox::{Outbox, PersistenceTask};
use super::scheduler::ScheduledTask;
use crate::config::SyncSettings;
use crate::error::PersistError;

/// What happened to one remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The remote store acknowledged the record.
    Synced,
    /// A newer revision was already confirmed; nothing was sent.
    Stale,
    /// Transient failure; the record waits in the outbox.
    Queued,
    /// Remote sync is disabled after an authentication failure.
    LocalOnly,
}

#[derive(Debug, Clone, Default)]
struct SyncState {
    created: bool,
    confirmed_revision: Option<u64>,
    drilled: HashSet<u32>,
}

#[derive(Debug, Default)]
struct CacheState {
    written: HashMap<SessionId, (u64, DateTime<Utc>)>,
    tombstones: HashSet<SessionId>,
}

struct PendingWrite {
    generation: u64,
    record: SessionRecord,
    task: ScheduledTask,
}

/// Place in a session's write queue. Dropping it lets the next writer go.
struct Turn {
    inner: Arc<Inner>,
    id: SessionId,
    ticket: u64,
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl Turn {
    async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = previous.await;
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        let mut turns = lock(&self.inner.turns);
        if turns.get(&self.id).is_some_and(|(ticket, _)| *ticket == self.ticket) {
            turns.remove(&self.id);
        }
    }
}

struct Inner {
    remote: Arc<dyn SessionRemote>,
    cache: Arc<dyn LocalCache>,
    clock: Clock,
    settings: SyncSettings,
    policy: RetryPolicy,
    outbox: Outbox,
    sync_states: Mutex<HashMap<SessionId, SyncState>>,
    turns: Mutex<HashMap<SessionId, (u64, oneshot::Receiver<()>)>>,
    cache_state: tokio::sync::Mutex<CacheState>,
    debounced: Mutex<HashMap<SessionId, PendingWrite>>,
    generation: AtomicU64,
    tickets: AtomicU64,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    local_only: AtomicBool,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves session snapshots to the local cache and the remote store.
///
/// Remote writes for one session run strictly in the order they were issued, and a
/// revision at or below the last confirmed one is never sent. Transient failures are
/// retried with exponential backoff, then parked in an in-memory outbox that
/// `process_pending_persists` replays. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PersistenceGateway {
    inner: Arc<Inner>,
}

impl PersistenceGateway {
    #[must_use]
    pub fn new(
        remote: Arc<dyn SessionRemote>,
        cache: Arc<dyn LocalCache>,
        clock: Clock,
        settings: SyncSettings,
    ) -> Self {
        let policy = RetryPolicy::from_settings(&settings);
        Self {
            inner: Arc::new(Inner {
                remote,
                cache,
                clock,
                settings,
                policy,
                outbox: Outbox::default(),
                sync_states: Mutex::new(HashMap::new()),
                turns: Mutex::new(HashMap::new()),
                cache_state: tokio::sync::Mutex::new(CacheState::default()),
                debounced: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                tickets: AtomicU64::new(0),
                in_flight: Mutex::new(Vec::new()),
                local_only: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn is_local_only(&self) -> bool {
        self.inner.local_only.load(Ordering::SeqCst)
    }

    /// Stop (or restart) talking to the remote store. Local caching is unaffected.
    pub fn set_local_only(&self, local_only: bool) {
        self.inner.local_only.store(local_only, Ordering::SeqCst);
    }

    /// Message of the most recent failed write, cleared by the next successful one.
    #[must_use]
    pub fn last_sync_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.inner.outbox.len()
    }

    #[must_use]
    pub fn outbox_tasks(&self) -> Vec<PersistenceTask> {
        self.inner.outbox.tasks()
    }

    #[must_use]
    pub fn has_scheduled_write(&self) -> bool {
        !lock(&self.inner.debounced).is_empty()
    }

    // ─── Remote writes ─────────────────────────────────────────────────────────

    /// Send `record` once the debounce window passes without another call for the
    /// same session.
    ///
    /// A newer call for that session replaces the pending record and restarts its
    /// window; other sessions keep their own.
    pub fn schedule_persist(&self, record: SessionRecord) {
        let id = record.id;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut pending = lock(&self.inner.debounced);
        let gateway = self.clone();
        let task = ScheduledTask::after(self.inner.settings.debounce, move || {
            gateway.fire_scheduled(id, generation);
        });
        if let Some(previous) = pending.insert(
            id,
            PendingWrite {
                generation,
                record,
                task,
            },
        ) {
            previous.task.cancel();
        }
    }

    /// Drop the pending debounced write for `id`. Returns true if one was dropped.
    pub fn cancel_scheduled(&self, id: SessionId) -> bool {
        self.take_scheduled(id).is_some()
    }

    /// Send every pending debounced write right away, oldest first.
    ///
    /// Returns how many went through the remote path, including ones that ended up
    /// queued. Every pending write is attempted even after a rejection.
    ///
    /// # Errors
    ///
    /// Returns the first `PersistError::Rejected` if the remote store refuses a record.
    pub async fn flush_scheduled(&self) -> Result<usize, PersistError> {
        let mut pending: Vec<PendingWrite> = lock(&self.inner.debounced).drain().map(|(_, p)| p).collect();
        pending.sort_by_key(|p| p.generation);

        let mut sent = 0;
        let mut first_error = None;
        for write in pending {
            write.task.cancel();
            match self.persist_session_to_server(write.record, 0).await {
                Ok(_) => sent += 1,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(sent), Err)
    }

    /// Send `record` in the background, bypassing the debounce window.
    pub fn spawn_persist(&self, record: SessionRecord) {
        let mut turn = self.take_turn(record.id);
        let gateway = self.clone();
        self.track(tokio::spawn(async move {
            turn.wait().await;
            let id = record.id;
            if let Err(err) = gateway.sync(record, 0).await {
                error!(session_id = %id, %err, "background session sync failed");
            }
        }));
    }

    /// Cancel any debounced write and send `record` now.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Rejected` if the remote store refuses the record.
    pub async fn persist_now(&self, record: SessionRecord) -> Result<PersistOutcome, PersistError> {
        self.cancel_scheduled(record.id);
        self.persist_session_to_server(record, 0).await
    }

    /// Write `record` to the remote store after every earlier write for the same session.
    ///
    /// 5xx responses are retried inline until `retry_count` reaches the retry limit,
    /// then queued together with network failures. A 401 switches the gateway to
    /// local-only mode.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Rejected` for any other client error.
    pub async fn persist_session_to_server(
        &self,
        record: SessionRecord,
        retry_count: u32,
    ) -> Result<PersistOutcome, PersistError> {
        let mut turn = self.take_turn(record.id);
        turn.wait().await;
        self.sync(record, retry_count).await
    }

    /// Replay the outbox once. Returns how many sessions were synced.
    pub async fn process_pending_persists(&self) -> usize {
        let max_age = chrono::Duration::from_std(self.inner.settings.outbox_max_age)
            .unwrap_or(chrono::Duration::MAX);
        let drained = self.inner.outbox.drain(
            self.inner.clock.now(),
            max_age,
            self.inner.settings.outbox_max_retries,
        );
        if drained.expired + drained.exhausted > 0 {
            warn!(
                expired = drained.expired,
                exhausted = drained.exhausted,
                "dropping undeliverable session writes"
            );
        }
        if drained.superseded > 0 {
            debug!(superseded = drained.superseded, "coalesced queued session writes");
        }

        let mut synced = 0;
        for task in drained.ready {
            let id = task.session_id();
            match self
                .persist_session_to_server(task.payload, task.retry_count + 1)
                .await
            {
                Ok(PersistOutcome::Synced) => synced += 1,
                Ok(outcome) => debug!(session_id = %id, ?outcome, "queued write not delivered"),
                Err(err) => error!(session_id = %id, %err, "queued write rejected"),
            }
        }
        synced
    }

    /// Replay the outbox every `outbox_sweep_interval` until the task is cancelled.
    #[must_use]
    pub fn start_outbox_sweeper(&self) -> ScheduledTask {
        let gateway = self.clone();
        ScheduledTask::every(self.inner.settings.outbox_sweep_interval, move || {
            let gateway = gateway.clone();
            async move {
                if gateway.outbox_len() > 0 {
                    gateway.process_pending_persists().await;
                }
            }
        })
    }

    /// Record that the remote store already holds `revision` of session `id`.
    pub fn mark_synced(&self, id: SessionId, revision: u64) {
        let mut states = lock(&self.inner.sync_states);
        let state = states.entry(id).or_default();
        state.created = true;
        state.confirmed_revision = Some(state.confirmed_revision.map_or(revision, |r| r.max(revision)));
    }

    /// Best-effort: end every other in-progress session for the same paper and variant.
    ///
    /// Writes still queued or debounced for an ended session are folded into the final
    /// record, which is stamped above every revision seen for it, so a later replay
    /// cannot reopen it. Returns how many sessions were ended. Failures are logged,
    /// never returned.
    pub async fn end_stale_sessions(
        &self,
        paper_id: &PaperId,
        paper_variant: &str,
        keep: SessionId,
        ended_at: DateTime<Utc>,
    ) -> usize {
        if self.is_local_only() {
            return 0;
        }
        let open = match self.inner.remote.list_in_progress().await {
            Ok(open) => open,
            Err(err) => {
                warn!(%err, "could not list in-progress sessions; skipping stale cleanup");
                return 0;
            }
        };

        let mut ended = 0;
        for listed in open {
            if listed.id == keep || &listed.paper_id != paper_id || listed.paper_variant != paper_variant {
                continue;
            }
            let id = listed.id;
            let mut turn = self.take_turn(id);
            turn.wait().await;

            let record = self.final_record(listed, ended_at);
            match self.inner.remote.update_session(&record).await {
                Ok(()) => {
                    self.mark_synced(id, record.revision);
                    ended += 1;
                    info!(session_id = %id, revision = record.revision, "ended stale session for the same paper");
                }
                Err(err) if err.is_transient() || err.is_network() => {
                    warn!(session_id = %id, %err, "could not end stale session; queued for later");
                    self.inner.outbox.push(PersistenceTask {
                        payload: record,
                        retry_count: 0,
                        enqueued_at: self.inner.clock.now(),
                    });
                }
                Err(err) => warn!(session_id = %id, %err, "could not end stale session"),
            }
            drop(turn);

            if let Err(err) = self.delete_cache(id).await {
                warn!(session_id = %id, %err, "could not drop cached stale session");
            }
        }
        ended
    }

    // ─── Remote reads ──────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns `RemoteError::NotFound` for an unknown id, or other remote errors.
    pub async fn fetch_remote(&self, id: SessionId) -> Result<SessionRecord, RemoteError> {
        self.inner.remote.fetch_session(id).await
    }

    /// # Errors
    ///
    /// Returns `RemoteError` if the listing cannot be fetched.
    pub async fn list_in_progress(&self) -> Result<Vec<SessionRecord>, RemoteError> {
        self.inner.remote.list_in_progress().await
    }

    // ─── Local cache ───────────────────────────────────────────────────────────

    /// Write `snapshot` in the background; failures are logged.
    pub fn spawn_cache_write(&self, snapshot: LocalSnapshot) {
        let gateway = self.clone();
        self.track(tokio::spawn(async move {
            if let Err(err) = gateway.write_cache(&snapshot).await {
                warn!(session_id = %snapshot.session_id(), %err, "local snapshot write failed");
            }
        }));
    }

    /// Store `snapshot` unless it is older than what this gateway last cached, or the
    /// session was deleted. Returns whether it was written.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the cache write fails.
    pub async fn write_cache(&self, snapshot: &LocalSnapshot) -> Result<bool, StorageError> {
        let mut state = self.inner.cache_state.lock().await;
        let id = snapshot.session_id();
        if state.tombstones.contains(&id) {
            return Ok(false);
        }
        let incoming = (snapshot.revision(), snapshot.saved_at);
        if state.written.get(&id).is_some_and(|written| *written > incoming) {
            debug!(session_id = %id, revision = snapshot.revision(), "skipping older snapshot");
            return Ok(false);
        }
        self.inner.cache.save_snapshot(snapshot).await?;
        state.written.insert(id, incoming);
        Ok(true)
    }

    /// Delete `id` in the background; failures are logged.
    pub fn spawn_cache_delete(&self, id: SessionId) {
        let gateway = self.clone();
        self.track(tokio::spawn(async move {
            if let Err(err) = gateway.delete_cache(id).await {
                warn!(session_id = %id, %err, "local snapshot delete failed");
            }
        }));
    }

    /// Delete the cached snapshot for `id`; later writes for it are ignored until
    /// `revive_cache` is called.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the cache delete fails.
    pub async fn delete_cache(&self, id: SessionId) -> Result<(), StorageError> {
        let mut state = self.inner.cache_state.lock().await;
        state.tombstones.insert(id);
        state.written.remove(&id);
        self.inner.cache.delete_snapshot(id).await
    }

    /// Accept cache writes for `id` again after it was deleted.
    pub async fn revive_cache(&self, id: SessionId) {
        if self.inner.cache_state.lock().await.tombstones.remove(&id) {
            debug!(session_id = %id, "local snapshot writes re-enabled");
        }
    }

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` when nothing is cached for `id`.
    pub async fn load_cache(&self, id: SessionId) -> Result<LocalSnapshot, StorageError> {
        self.inner.cache.load_snapshot(id).await
    }

    /// # Errors
    ///
    /// Returns `StorageError` if the listing fails.
    pub async fn cached_sessions(&self) -> Result<Vec<SessionId>, StorageError> {
        self.inner.cache.list_snapshots().await
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────────

    /// Wait for every background write spawned so far, including ones they spawn.
    ///
    /// Debounced writes still waiting for their window are not included.
    pub async fn settle(&self) {
        loop {
            let handles = std::mem::take(&mut *lock(&self.inner.in_flight));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    if err.is_panic() {
                        error!("background persistence task panicked");
                    }
                }
            }
        }
    }

    /// Send every debounced write now and wait for all background writes.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Rejected` if a debounced record is refused.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let result = self.flush_scheduled().await;
        self.settle().await;
        result.map(drop)
    }

    // ─── Internals ─────────────────────────────────────────────────────────────

    fn fire_scheduled(&self, id: SessionId, generation: u64) {
        let pending = {
            let mut pending = lock(&self.inner.debounced);
            if pending.get(&id).is_some_and(|write| write.generation == generation) {
                pending.remove(&id)
            } else {
                None
            }
        };
        if let Some(write) = pending {
            self.spawn_persist(write.record);
        }
    }

    fn take_scheduled(&self, id: SessionId) -> Option<SessionRecord> {
        let write = lock(&self.inner.debounced).remove(&id)?;
        write.task.cancel();
        Some(write.record)
    }

    fn confirmed_revision(&self, id: SessionId) -> Option<u64> {
        lock(&self.inner.sync_states).get(&id).and_then(|state| state.confirmed_revision)
    }

    /// Caller must hold the session's turn.
    fn final_record(&self, listed: SessionRecord, ended_at: DateTime<Utc>) -> SessionRecord {
        let id = listed.id;
        let floor = listed.revision.max(self.confirmed_revision(id).unwrap_or(0));
        let newest = self
            .inner
            .outbox
            .take_session(id)
            .into_iter()
            .map(|task| task.payload)
            .chain(self.take_scheduled(id))
            .max_by_key(|record| record.revision);

        let mut record = match newest {
            Some(newest) if newest.revision > listed.revision => {
                debug!(session_id = %id, revision = newest.revision, "folding unsent edits into ended session");
                newest
            }
            _ => listed,
        };
        record.revision = record.revision.max(floor) + 1;
        if record.ended_at.is_none() {
            record.ended_at = Some(ended_at);
        }
        record
    }

    fn take_turn(&self, id: SessionId) -> Turn {
        let ticket = self.inner.tickets.fetch_add(1, Ordering::SeqCst);
        let (done, next) = oneshot::channel();
        let previous = lock(&self.inner.turns)
            .insert(id, (ticket, next))
            .map(|(_, previous)| previous);
        Turn {
            inner: Arc::clone(&self.inner),
            id,
            ticket,
            previous,
            _done: done,
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut in_flight = lock(&self.inner.in_flight);
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    fn set_last_error(&self, message: Option<String>) {
        *lock(&self.inner.last_error) = message;
    }

    /// Caller must hold the session's turn.
    async fn sync(&self, record: SessionRecord, retry_count: u32) -> Result<PersistOutcome, PersistError> {
        if self.is_local_only() {
            debug!(session_id = %record.id, "local-only mode; skipping remote write");
            return Ok(PersistOutcome::LocalOnly);
        }

        let id = record.id;
        let mut state = lock(&self.inner.sync_states).get(&id).cloned().unwrap_or_default();
        let outcome = self.sync_with_state(&mut state, record, retry_count).await;
        lock(&self.inner.sync_states).insert(id, state);
        outcome
    }

    async fn sync_with_state(
        &self,
        state: &mut SyncState,
        record: SessionRecord,
        retry_count: u32,
    ) -> Result<PersistOutcome, PersistError> {
        if state
            .confirmed_revision
            .is_some_and(|confirmed| record.revision <= confirmed)
        {
            debug!(session_id = %record.id, revision = record.revision, "skipping stale revision");
            return Ok(PersistOutcome::Stale);
        }

        let mut attempt = retry_count;
        loop {
            match self.send(state, &record).await {
                Ok(()) => {
                    state.confirmed_revision = Some(record.revision);
                    let cleared = self.inner.outbox.clear_session(record.id);
                    debug!(
                        session_id = %record.id,
                        revision = record.revision,
                        cleared,
                        "session synced"
                    );
                    if record.is_ended() {
                        self.submit_drill_items(state, &record).await;
                    }
                    self.set_last_error(None);
                    return Ok(PersistOutcome::Synced);
                }
                Err(RemoteError::Unauthorized) => {
                    warn!(session_id = %record.id, "remote store refused credentials; continuing local-only");
                    self.set_local_only(true);
                    self.set_last_error(Some(RemoteError::Unauthorized.to_string()));
                    return Ok(PersistOutcome::LocalOnly);
                }
                Err(err) if err.is_transient() && self.inner.policy.should_retry(attempt) => {
                    let delay = self.inner.policy.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        session_id = %record.id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %err,
                        "session sync failed, will retry after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() || err.is_network() => {
                    warn!(
                        session_id = %record.id,
                        retry_count = attempt,
                        %err,
                        "session sync failed; queued for later"
                    );
                    self.set_last_error(Some(err.to_string()));
                    self.inner.outbox.push(PersistenceTask {
                        payload: record,
                        retry_count: attempt,
                        enqueued_at: self.inner.clock.now(),
                    });
                    return Ok(PersistOutcome::Queued);
                }
                Err(err) => {
                    error!(session_id = %record.id, %err, "remote store rejected session");
                    self.set_last_error(Some(err.to_string()));
                    return Err(PersistError::Rejected(err));
                }
            }
        }
    }

    /// Create until the remote store confirms the session exists, then update.
    async fn send(&self, state: &mut SyncState, record: &SessionRecord) -> Result<(), RemoteError> {
        let remote = &self.inner.remote;
        if state.created {
            match remote.update_session(record).await {
                Err(RemoteError::NotFound) => {
                    state.created = false;
                    remote.create_session(record).await?;
                    state.created = true;
                    Ok(())
                }
                other => other,
            }
        } else {
            match remote.create_session(record).await {
                Ok(()) => {
                    state.created = true;
                    Ok(())
                }
                Err(RemoteError::Conflict) => {
                    state.created = true;
                    remote.update_session(record).await
                }
                Err(err) => Err(err),
            }
        }
    }

    /// Each question is submitted at most once per gateway; failures are not retried.
    async fn submit_drill_items(&self, state: &mut SyncState, record: &SessionRecord) {
        let items: Vec<_> = derive_drill_items(record)
            .into_iter()
            .filter(|item| !state.drilled.contains(&item.question_number))
            .collect();
        if items.is_empty() {
            return;
        }
        state.drilled.extend(items.iter().map(|item| item.question_number));

        match self.inner.remote.insert_drill_items(&items).await {
            Ok(()) => info!(session_id = %record.id, count = items.len(), "drill items submitted"),
            Err(err) => warn!(session_id = %record.id, %err, "drill item submission failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::time::manual_clock;
    use storage::{InMemoryLocalCache, InMemorySessionRemote};

    fn gateway() -> PersistenceGateway {
        PersistenceGateway::new(
            Arc::new(InMemorySessionRemote::new()),
            Arc::new(InMemoryLocalCache::new()),
            manual_clock(),
            SyncSettings::default(),
        )
    }

    #[tokio::test]
    async fn finished_turns_are_released() {
        let gw = gateway();
        let id = SessionId::generate();
        let first = gw.take_turn(id);
        let mut second = gw.take_turn(id);
        assert_eq!(lock(&gw.inner.turns).len(), 1);

        drop(first);
        second.wait().await;
        assert_eq!(lock(&gw.inner.turns).len(), 1);

        drop(second);
        assert!(lock(&gw.inner.turns).is_empty());
    }
}
