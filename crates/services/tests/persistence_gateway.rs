use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use exam_core::TimingEngine;
use exam_core::model::{ExamFamily, PaperId, QuestionRange, SessionId};
use exam_core::time::{fixed_now, manual_clock};
use services::{Clock, PersistError, PersistOutcome, PersistenceGateway, SyncSettings};
use storage::{
    AnswerRecord, DrillItemRecord, InMemoryLocalCache, InMemorySessionRemote, LocalCache,
    LocalSnapshot, RemoteCall, RemoteError, SessionRecord, SessionRemote, StorageError,
};
use tokio::time::Instant;

fn record(revision: u64) -> SessionRecord {
    let now = fixed_now();
    SessionRecord {
        id: SessionId::generate(),
        paper_id: PaperId::new("paper-1"),
        paper_name: "Paper 1".into(),
        paper_variant: "A".into(),
        session_name: "mock".into(),
        exam_family: ExamFamily::Standard,
        question_range: QuestionRange { start: 1, end: 4 },
        selected_sections: Vec::new(),
        selected_part_ids: Vec::new(),
        question_order: vec![None; 4],
        time_limit_minutes: 30,
        started_at: now,
        deadline_at: now + ChronoDuration::minutes(30),
        ended_at: None,
        per_question_sec: vec![0; 4],
        answers: vec![AnswerRecord::default(); 4],
        correct_flags: vec![None; 4],
        guessed_flags: vec![false; 4],
        review_flags: vec![false; 4],
        mistake_tags: vec![String::new(); 4],
        answer_key: vec![None; 4],
        notes: String::new(),
        score: 0,
        revision,
    }
}

fn revised(base: &SessionRecord, revision: u64) -> SessionRecord {
    let mut next = base.clone();
    next.revision = revision;
    next
}

fn gateway_with(remote: Arc<dyn SessionRemote>, cache: &InMemoryLocalCache, clock: Clock) -> PersistenceGateway {
    PersistenceGateway::new(remote, Arc::new(cache.clone()), clock, SyncSettings::default())
}

fn gateway(remote: &InMemorySessionRemote) -> PersistenceGateway {
    gateway_with(Arc::new(remote.clone()), &InMemoryLocalCache::new(), manual_clock())
}

/// Records the tokio instant of every create/update.
#[derive(Clone, Default)]
struct TimedRemote {
    inner: InMemorySessionRemote,
    writes: Arc<Mutex<Vec<Instant>>>,
}

impl TimedRemote {
    fn offsets_ms(&self, start: Instant) -> Vec<u128> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_millis())
            .collect()
    }

    fn stamp(&self) {
        self.writes.lock().unwrap().push(Instant::now());
    }
}

#[async_trait]
impl SessionRemote for TimedRemote {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
        self.stamp();
        self.inner.create_session(record).await
    }

    async fn update_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
        self.stamp();
        self.inner.update_session(record).await
    }

    async fn fetch_session(&self, id: SessionId) -> Result<SessionRecord, RemoteError> {
        self.inner.fetch_session(id).await
    }

    async fn list_in_progress(&self) -> Result<Vec<SessionRecord>, RemoteError> {
        self.inner.list_in_progress().await
    }

    async fn insert_drill_items(&self, items: &[DrillItemRecord]) -> Result<(), RemoteError> {
        self.inner.insert_drill_items(items).await
    }
}

#[tokio::test(start_paused = true)]
async fn rapid_edits_coalesce_into_one_write() {
    let remote = InMemorySessionRemote::new();
    let gw = gateway(&remote);
    let base = record(1);

    for revision in 1..=5 {
        gw.schedule_persist(revised(&base, revision));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(remote.write_count(), 0);
    assert!(gw.has_scheduled_write());

    tokio::time::sleep(Duration::from_millis(800)).await;
    gw.settle().await;

    assert_eq!(
        remote.calls(),
        vec![RemoteCall::Create {
            id: base.id,
            revision: 5
        }]
    );
    assert!(!gw.has_scheduled_write());
}

#[tokio::test(start_paused = true)]
async fn cancelled_schedule_sends_nothing() {
    let remote = InMemorySessionRemote::new();
    let gw = gateway(&remote);

    let pending = record(1);
    gw.schedule_persist(pending.clone());
    assert!(!gw.cancel_scheduled(SessionId::generate()));
    assert!(gw.cancel_scheduled(pending.id));
    tokio::time::sleep(Duration::from_secs(2)).await;
    gw.settle().await;

    assert_eq!(remote.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn each_session_debounces_on_its_own() {
    let remote = InMemorySessionRemote::new();
    let gw = gateway(&remote);
    let first = record(1);
    let second = record(1);

    gw.schedule_persist(first.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    gw.schedule_persist(second.clone());
    gw.schedule_persist(revised(&first, 2));
    tokio::time::sleep(Duration::from_secs(2)).await;
    gw.settle().await;

    assert_eq!(remote.write_count(), 2);
    assert_eq!(remote.session(first.id).unwrap().revision, 2);
    assert_eq!(remote.session(second.id).unwrap().revision, 1);
    assert!(!gw.has_scheduled_write());
}

#[tokio::test(start_paused = true)]
async fn flush_sends_every_pending_session() {
    let remote = InMemorySessionRemote::new();
    let gw = gateway(&remote);
    let first = record(3);
    let second = record(7);

    gw.schedule_persist(first.clone());
    gw.schedule_persist(second.clone());
    gw.flush().await.unwrap();

    assert_eq!(
        remote.calls(),
        vec![
            RemoteCall::Create {
                id: first.id,
                revision: 3
            },
            RemoteCall::Create {
                id: second.id,
                revision: 7
            },
        ]
    );
    tokio::time::sleep(Duration::from_secs(2)).await;
    gw.settle().await;
    assert_eq!(remote.write_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn server_errors_back_off_then_queue() {
    let remote = TimedRemote::default();
    remote.inner.fail_always(Some(RemoteError::Server { status: 503 }));
    let gw = gateway_with(Arc::new(remote.clone()), &InMemoryLocalCache::new(), manual_clock());

    let start = Instant::now();
    let outcome = gw.persist_session_to_server(record(1), 0).await.unwrap();

    assert_eq!(outcome, PersistOutcome::Queued);
    assert_eq!(remote.offsets_ms(start), vec![0, 1000, 3000, 7000]);
    let queued = gw.outbox_tasks();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 3);
    assert!(gw.last_sync_error().is_some());
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_inline() {
    let remote = InMemorySessionRemote::new();
    remote.fail_next(RemoteError::Server { status: 500 });
    let gw = gateway(&remote);

    let outcome = gw.persist_session_to_server(record(1), 0).await.unwrap();

    assert_eq!(outcome, PersistOutcome::Synced);
    assert_eq!(remote.write_count(), 2);
    assert_eq!(gw.outbox_len(), 0);
    assert!(gw.last_sync_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn outbox_drains_after_network_recovers() {
    let remote = InMemorySessionRemote::new();
    for _ in 0..3 {
        remote.fail_next(RemoteError::Network("connection reset".into()));
    }
    let gw = gateway(&remote);
    let base = record(1);

    for revision in 1..=3 {
        let outcome = gw
            .persist_session_to_server(revised(&base, revision), 0)
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Queued);
    }
    assert_eq!(gw.outbox_len(), 3);

    let outcome = gw.persist_session_to_server(revised(&base, 4), 0).await.unwrap();
    assert_eq!(outcome, PersistOutcome::Synced);
    assert_eq!(gw.outbox_len(), 0);
    assert_eq!(remote.session(base.id).unwrap().revision, 4);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_switches_to_local_only() {
    let remote = InMemorySessionRemote::new();
    remote.fail_next(RemoteError::Unauthorized);
    let gw = gateway(&remote);
    let base = record(1);

    let outcome = gw.persist_session_to_server(base.clone(), 0).await.unwrap();
    assert_eq!(outcome, PersistOutcome::LocalOnly);
    assert!(gw.is_local_only());
    assert_eq!(gw.outbox_len(), 0);

    let outcome = gw.persist_session_to_server(revised(&base, 2), 0).await.unwrap();
    assert_eq!(outcome, PersistOutcome::LocalOnly);
    assert_eq!(remote.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn permanent_rejection_bubbles_up() {
    let remote = InMemorySessionRemote::new();
    remote.fail_next(RemoteError::Rejected {
        status: 422,
        message: "bad range".into(),
    });
    let gw = gateway(&remote);

    let err = gw.persist_session_to_server(record(1), 0).await.unwrap_err();

    assert!(matches!(
        err,
        PersistError::Rejected(RemoteError::Rejected { status: 422, .. })
    ));
    assert_eq!(gw.outbox_len(), 0);
    assert_eq!(remote.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_revisions_are_not_sent() {
    let remote = InMemorySessionRemote::new();
    let gw = gateway(&remote);
    let base = record(3);

    gw.persist_session_to_server(base.clone(), 0).await.unwrap();
    let outcome = gw.persist_session_to_server(revised(&base, 2), 0).await.unwrap();

    assert_eq!(outcome, PersistOutcome::Stale);
    assert_eq!(remote.write_count(), 1);
    assert_eq!(remote.session(base.id).unwrap().revision, 3);
}

#[tokio::test(start_paused = true)]
async fn background_writes_keep_issue_order() {
    let remote = InMemorySessionRemote::new();
    let gw = gateway(&remote);
    let base = record(1);

    for revision in 1..=4 {
        gw.spawn_persist(revised(&base, revision));
    }
    gw.settle().await;

    assert_eq!(
        remote.calls(),
        vec![
            RemoteCall::Create { id: base.id, revision: 1 },
            RemoteCall::Update { id: base.id, revision: 2 },
            RemoteCall::Update { id: base.id, revision: 3 },
            RemoteCall::Update { id: base.id, revision: 4 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn existing_remote_session_is_updated_after_conflict() {
    let remote = InMemorySessionRemote::new();
    let base = record(1);
    remote.insert(base.clone());
    let gw = gateway(&remote);

    let outcome = gw.persist_session_to_server(revised(&base, 2), 0).await.unwrap();

    assert_eq!(outcome, PersistOutcome::Synced);
    assert_eq!(
        remote.calls(),
        vec![
            RemoteCall::Create { id: base.id, revision: 2 },
            RemoteCall::Update { id: base.id, revision: 2 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn replay_sends_newest_queued_write_only() {
    let remote = InMemorySessionRemote::new();
    remote.fail_next(RemoteError::Network("offline".into()));
    remote.fail_next(RemoteError::Network("offline".into()));
    let gw = gateway(&remote);
    let base = record(1);

    gw.persist_session_to_server(revised(&base, 1), 0).await.unwrap();
    gw.persist_session_to_server(revised(&base, 2), 0).await.unwrap();
    assert_eq!(gw.outbox_len(), 2);

    let synced = gw.process_pending_persists().await;

    assert_eq!(synced, 1);
    assert_eq!(gw.outbox_len(), 0);
    assert_eq!(remote.write_count(), 3);
    assert_eq!(remote.session(base.id).unwrap().revision, 2);
}

#[tokio::test(start_paused = true)]
async fn replay_drops_expired_and_exhausted_writes() {
    let remote = InMemorySessionRemote::new();
    let clock = manual_clock();
    let gw = gateway_with(Arc::new(remote.clone()), &InMemoryLocalCache::new(), clock.clone());

    remote.fail_always(Some(RemoteError::Server { status: 502 }));
    gw.persist_session_to_server(record(1), 0).await.unwrap();
    remote.fail_always(None);
    remote.fail_next(RemoteError::Network("offline".into()));
    gw.persist_session_to_server(record(1), 0).await.unwrap();
    assert_eq!(gw.outbox_len(), 2);
    let writes_before = remote.write_count();

    let mut later = clock.clone();
    later.advance(ChronoDuration::minutes(6));
    let synced = gw.process_pending_persists().await;

    assert_eq!(synced, 0);
    assert_eq!(gw.outbox_len(), 0);
    assert_eq!(remote.write_count(), writes_before);
}

#[tokio::test(start_paused = true)]
async fn replayed_failures_count_toward_the_limit() {
    let remote = InMemorySessionRemote::new();
    remote.fail_always(Some(RemoteError::Network("offline".into())));
    let gw = gateway(&remote);

    gw.persist_session_to_server(record(1), 0).await.unwrap();
    for expected_retry in 1..=3 {
        gw.process_pending_persists().await;
        let queued = gw.outbox_tasks();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, expected_retry);
    }

    gw.process_pending_persists().await;
    assert_eq!(gw.outbox_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn ended_session_submits_drill_items_once() {
    let remote = InMemorySessionRemote::new();
    let gw = gateway(&remote);
    let mut ended = record(1);
    ended.ended_at = Some(fixed_now() + ChronoDuration::minutes(20));
    ended.answers[0].add_to_drill = true;
    ended.answers[3].add_to_drill = true;

    gw.persist_session_to_server(ended.clone(), 0).await.unwrap();
    gw.persist_session_to_server(revised(&ended, 2), 0).await.unwrap();

    let items = remote.drill_items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].question_number, 1);
    assert_eq!(items[1].question_number, 4);
    let drill_calls = remote
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RemoteCall::InsertDrillItems(_)))
        .count();
    assert_eq!(drill_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn drill_failure_does_not_fail_the_sync() {
    let remote = InMemorySessionRemote::new();
    remote.fail_next_drill(RemoteError::Server { status: 500 });
    let gw = gateway(&remote);
    let mut ended = record(1);
    ended.ended_at = Some(fixed_now());
    ended.answers[2].add_to_drill = true;

    let outcome = gw.persist_session_to_server(ended.clone(), 0).await.unwrap();
    gw.persist_session_to_server(revised(&ended, 2), 0).await.unwrap();

    assert_eq!(outcome, PersistOutcome::Synced);
    assert!(remote.drill_items().is_empty());
    assert!(remote.calls().contains(&RemoteCall::InsertDrillItems(1)));
    assert_eq!(
        remote
            .calls()
            .iter()
            .filter(|c| matches!(c, RemoteCall::InsertDrillItems(_)))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn stale_sessions_for_the_same_paper_are_ended() {
    let remote = InMemorySessionRemote::new();
    let same = record(4);
    let mut other_variant = record(1);
    other_variant.paper_variant = "B".into();
    let mut other_paper = record(1);
    other_paper.paper_id = PaperId::new("paper-2");
    for r in [&same, &other_variant, &other_paper] {
        remote.insert(r.clone());
    }
    let gw = gateway(&remote);
    let keep = SessionId::generate();

    let ended = gw
        .end_stale_sessions(&PaperId::new("paper-1"), "A", keep, fixed_now())
        .await;

    assert_eq!(ended, 1);
    let stored = remote.session(same.id).unwrap();
    assert_eq!(stored.ended_at, Some(fixed_now()));
    assert_eq!(stored.revision, 5);
    assert!(remote.session(other_variant.id).unwrap().ended_at.is_none());
    assert!(remote.session(other_paper.id).unwrap().ended_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn queued_edits_cannot_reopen_an_ended_stale_session() {
    let remote = InMemorySessionRemote::new();
    let gw = gateway(&remote);
    let stale = record(1);
    gw.persist_session_to_server(stale.clone(), 0).await.unwrap();

    remote.fail_always(Some(RemoteError::Network("offline".into())));
    let mut edited = revised(&stale, 2);
    edited.answers[0].choice = "B".into();
    gw.persist_session_to_server(edited.clone(), 0).await.unwrap();
    edited.revision = 3;
    edited.answers[1].choice = "C".into();
    gw.persist_session_to_server(edited.clone(), 0).await.unwrap();
    edited.revision = 4;
    gw.schedule_persist(edited);
    assert_eq!(gw.outbox_len(), 2);
    remote.fail_always(None);

    let ended = gw
        .end_stale_sessions(&PaperId::new("paper-1"), "A", SessionId::generate(), fixed_now())
        .await;
    assert_eq!(ended, 1);
    assert_eq!(gw.outbox_len(), 0);
    assert!(!gw.has_scheduled_write());

    assert_eq!(gw.process_pending_persists().await, 0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    gw.settle().await;

    let stored = remote.session(stale.id).unwrap();
    assert_eq!(stored.ended_at, Some(fixed_now()));
    assert_eq!(stored.revision, 5);
    assert_eq!(stored.answers[1].choice, "C");
    assert!(remote.list_in_progress().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_end_is_queued_when_the_remote_is_down() {
    #[derive(Clone, Default)]
    struct DownForUpdates(InMemorySessionRemote);

    #[async_trait]
    impl SessionRemote for DownForUpdates {
        async fn create_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
            self.0.create_session(record).await
        }
        async fn update_session(&self, _record: &SessionRecord) -> Result<(), RemoteError> {
            Err(RemoteError::Network("offline".into()))
        }
        async fn fetch_session(&self, id: SessionId) -> Result<SessionRecord, RemoteError> {
            self.0.fetch_session(id).await
        }
        async fn list_in_progress(&self) -> Result<Vec<SessionRecord>, RemoteError> {
            self.0.list_in_progress().await
        }
        async fn insert_drill_items(&self, items: &[DrillItemRecord]) -> Result<(), RemoteError> {
            self.0.insert_drill_items(items).await
        }
    }

    let remote = DownForUpdates::default();
    let stale = record(2);
    remote.0.insert(stale.clone());
    let gw = gateway_with(Arc::new(remote), &InMemoryLocalCache::new(), manual_clock());

    let ended = gw
        .end_stale_sessions(&PaperId::new("paper-1"), "A", SessionId::generate(), fixed_now())
        .await;

    assert_eq!(ended, 0);
    let queued = gw.outbox_tasks();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload.revision, 3);
    assert_eq!(queued[0].payload.ended_at, Some(fixed_now()));
}

#[tokio::test(start_paused = true)]
async fn stale_cleanup_survives_listing_failure() {
    #[derive(Clone, Default)]
    struct BrokenListing(InMemorySessionRemote);

    #[async_trait]
    impl SessionRemote for BrokenListing {
        async fn create_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
            self.0.create_session(record).await
        }
        async fn update_session(&self, record: &SessionRecord) -> Result<(), RemoteError> {
            self.0.update_session(record).await
        }
        async fn fetch_session(&self, id: SessionId) -> Result<SessionRecord, RemoteError> {
            self.0.fetch_session(id).await
        }
        async fn list_in_progress(&self) -> Result<Vec<SessionRecord>, RemoteError> {
            Err(RemoteError::Network("timed out".into()))
        }
        async fn insert_drill_items(&self, items: &[DrillItemRecord]) -> Result<(), RemoteError> {
            self.0.insert_drill_items(items).await
        }
    }

    let gw = gateway_with(Arc::new(BrokenListing::default()), &InMemoryLocalCache::new(), manual_clock());
    let ended = gw
        .end_stale_sessions(&PaperId::new("paper-1"), "A", SessionId::generate(), fixed_now())
        .await;
    assert_eq!(ended, 0);
}

fn snapshot(record: SessionRecord, saved_at: chrono::DateTime<chrono::Utc>) -> LocalSnapshot {
    LocalSnapshot {
        timing: TimingEngine::single(Vec::new(), record.time_limit_minutes, 0, fixed_now()),
        record,
        current_question: 0,
        saved_at,
    }
}

#[tokio::test]
async fn cache_writes_respect_revision_and_tombstones() {
    let cache = InMemoryLocalCache::new();
    let gw = gateway_with(Arc::new(InMemorySessionRemote::new()), &cache, manual_clock());
    let base = record(2);

    assert!(gw.write_cache(&snapshot(base.clone(), fixed_now())).await.unwrap());
    let older = revised(&base, 1);
    assert!(!gw.write_cache(&snapshot(older, fixed_now())).await.unwrap());
    assert_eq!(cache.load_snapshot(base.id).await.unwrap().revision(), 2);

    let later_tick = fixed_now() + ChronoDuration::seconds(1);
    assert!(gw.write_cache(&snapshot(base.clone(), later_tick)).await.unwrap());

    gw.delete_cache(base.id).await.unwrap();
    assert!(!gw.write_cache(&snapshot(revised(&base, 9), later_tick)).await.unwrap());
    assert!(matches!(
        gw.load_cache(base.id).await,
        Err(StorageError::NotFound)
    ));

    gw.revive_cache(base.id).await;
    assert!(gw.write_cache(&snapshot(revised(&base, 10), later_tick)).await.unwrap());
    assert_eq!(cache.load_snapshot(base.id).await.unwrap().revision(), 10);
}
