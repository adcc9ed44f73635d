use chrono::{DateTime, Duration, Utc};
use exam_core::model::{CorrectFlag, QuestionId, QuestionRange, Session, SessionConfig, SessionId};
use exam_core::{AnswerLedger, Clock, LedgerError, ResumeOutcome, SectionPlan, TimerTick, TimingEngine};
use storage::{QuestionBank, RemoteError, SessionRecord, StorageError};
use tracing::{debug, info, warn};

use super::plan::{PlanBuilder, SectionClassifier};
use super::snapshot::ActiveSession;
use crate::error::ControllerError;
use crate::sync::PersistenceGateway;

/// Single entry point for one exam attempt.
///
/// Owns the live session, its answers and its timers. Every mutating call updates the
/// local cache and schedules a remote write through the `PersistenceGateway`; none of
/// the synchronous calls wait on the network.
pub struct SessionController {
    clock: Clock,
    gateway: PersistenceGateway,
    active: Option<ActiveSession>,
    abandoned: Option<(SessionId, DateTime<Utc>)>,
}

impl SessionController {
    #[must_use]
    pub fn new(clock: Clock, gateway: PersistenceGateway) -> Self {
        Self {
            clock,
            gateway,
            active: None,
            abandoned: None,
        }
    }

    #[must_use]
    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    #[must_use]
    pub fn has_session(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session().map(Session::id)
    }

    #[must_use]
    pub fn ledger(&self) -> Option<&AnswerLedger> {
        self.active.as_ref().map(|a| &a.ledger)
    }

    #[must_use]
    pub fn timing(&self) -> Option<&TimingEngine> {
        self.active.as_ref().map(|a| &a.timing)
    }

    #[must_use]
    pub fn question_order(&self) -> &[Option<QuestionId>] {
        self.active.as_ref().map_or(&[], |a| a.question_order.as_slice())
    }

    #[must_use]
    pub fn revision(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.revision)
    }

    /// Full snapshot of the active session as the remote store would receive it.
    #[must_use]
    pub fn record(&self) -> Option<SessionRecord> {
        self.active.as_ref().map(ActiveSession::to_record)
    }

    #[must_use]
    pub fn current_question(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.timing.last_question_index())
    }

    // ─── Derived values ────────────────────────────────────────────────────────

    #[must_use]
    pub fn total_questions(&self) -> usize {
        self.session().map_or(0, Session::total_questions)
    }

    #[must_use]
    pub fn correct_count(&self) -> usize {
        self.ledger().map_or(0, AnswerLedger::correct_count)
    }

    #[must_use]
    pub fn answered_count(&self) -> usize {
        self.ledger().map_or(0, AnswerLedger::answered_count)
    }

    /// Time left in the current section; zero without a running session.
    #[must_use]
    pub fn remaining_time(&self) -> Duration {
        let Some(active) = self.active.as_ref().filter(|a| !a.session.is_ended()) else {
            return Duration::zero();
        };
        active
            .timing
            .section_remaining_time(active.timing.current_index(), self.clock.now())
            .unwrap_or_else(|_| Duration::zero())
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `TimingError::SectionOutOfRange`.
    pub fn section_remaining_time(&self, index: usize) -> Result<Duration, ControllerError> {
        let active = self.active.as_ref().ok_or(ControllerError::NoActiveSession)?;
        Ok(active.timing.section_remaining_time(index, self.clock.now())?)
    }

    #[must_use]
    pub fn instruction_remaining(&self) -> Option<Duration> {
        let active = self.active.as_ref()?;
        active.timing.instruction_remaining(self.clock.now())
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn derived_correct_flag(&self, index: usize) -> Result<Option<bool>, ControllerError> {
        let ledger = self.ledger().ok_or(ControllerError::NoActiveSession)?;
        Ok(ledger.derived_correct_flag(index)?)
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────────

    /// Start a fresh attempt and make it the active session.
    ///
    /// Other in-progress sessions for the same paper and variant are ended on a best
    /// effort basis first.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidRange` before anything changes if the range is invalid.
    pub async fn start_session(&mut self, config: SessionConfig) -> Result<SessionId, ControllerError> {
        config.question_range.validate()?;
        let now = self.clock.now();
        let id = SessionId::generate();
        let session = Session::start(id, config, now)?;

        self.flush_previous().await;
        let ended = self
            .gateway
            .end_stale_sessions(session.paper_id(), session.paper_variant(), id, now)
            .await;
        if ended > 0 {
            debug!(session_id = %id, ended, "ended older attempts before starting");
        }

        let active = ActiveSession::start(session, now);
        info!(
            session_id = %id,
            paper_id = %active.session.paper_id(),
            total_questions = active.session.total_questions(),
            "session started"
        );
        self.gateway.spawn_cache_write(active.to_local(now));
        self.gateway.spawn_persist(active.to_record());
        self.active = Some(active);
        Ok(id)
    }

    /// Abandon the active session: end it remotely, drop its cache entry, forget it.
    ///
    /// Calling it without a session does nothing.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Storage` if the cache entry cannot be deleted.
    pub async fn reset_session(&mut self) -> Result<(), ControllerError> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        let now = self.clock.now();
        let id = active.session.id();
        self.gateway.cancel_scheduled(id);
        self.abandoned = Some((id, now));

        if !active.session.is_ended() {
            active.session.set_ended_at(now);
            active.timing.pause(now);
            active.touch();
            if let Err(err) = self.gateway.persist_session_to_server(active.to_record(), 0).await {
                warn!(session_id = %id, %err, "could not end abandoned session remotely");
            }
        }
        self.gateway.delete_cache(id).await?;
        info!(session_id = %id, "session reset");
        Ok(())
    }

    /// Mark the active session ended at `at`, stop its clocks and sync it right away.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession`, a cache error, or
    /// `PersistError::Rejected` if the remote store refuses the final record.
    pub async fn set_ended_at(&mut self, at: DateTime<Utc>) -> Result<(), ControllerError> {
        let now = self.clock.now();
        let active = self.active.as_mut().ok_or(ControllerError::NoActiveSession)?;
        active.session.set_ended_at(at);
        active.timing.pause(now);
        active.touch();
        let id = active.session.id();
        let record = active.to_record();
        info!(session_id = %id, correct = self.correct_count(), "session ended");

        self.gateway.delete_cache(id).await?;
        self.gateway.persist_now(record).await?;
        Ok(())
    }

    /// Make session `id` active again, from the local cache or else the remote store.
    ///
    /// Restored clocks are paused at the last moment the session was seen active, and
    /// its local snapshot is written again from the next edit on.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::RecentlyAbandoned` inside the abandon guard window,
    /// `ControllerError::NotFound` when neither store knows the id, or the
    /// underlying storage/remote error.
    pub async fn restore_session(&mut self, id: SessionId) -> Result<(), ControllerError> {
        let now = self.clock.now();
        if let Some((abandoned, at)) = self.abandoned {
            let guard = Duration::from_std(self.gateway.settings().abandon_guard).unwrap_or(Duration::zero());
            if abandoned == id && now - at < guard {
                warn!(session_id = %id, "refusing to restore a session that was just abandoned");
                return Err(ControllerError::RecentlyAbandoned(id));
            }
        }
        if self.session_id() == Some(id) {
            return Ok(());
        }

        let restored = match self.gateway.load_cache(id).await {
            Ok(snapshot) => {
                debug!(session_id = %id, revision = snapshot.revision(), "restoring from local cache");
                ActiveSession::from_local(snapshot)?
            }
            Err(StorageError::NotFound) => match self.gateway.fetch_remote(id).await {
                Ok(record) => {
                    debug!(session_id = %id, revision = record.revision, "restoring from remote store");
                    self.gateway.mark_synced(id, record.revision);
                    ActiveSession::from_remote(record, now)?
                }
                Err(RemoteError::NotFound) => return Err(ControllerError::NotFound(id)),
                Err(err) => return Err(err.into()),
            },
            Err(err) => return Err(err.into()),
        };

        self.flush_previous().await;
        self.gateway.revive_cache(id).await;
        info!(session_id = %id, ended = restored.session.is_ended(), "session restored");
        self.active = Some(restored);
        Ok(())
    }

    /// Sessions the remote store still considers in progress.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Remote` if the listing fails.
    pub async fn in_progress_sessions(&self) -> Result<Vec<SessionRecord>, ControllerError> {
        Ok(self.gateway.list_in_progress().await?)
    }

    /// Replay queued remote writes. Returns how many sessions were synced.
    pub async fn process_pending_persists(&self) -> usize {
        self.gateway.process_pending_persists().await
    }

    // ─── Questions and sections ────────────────────────────────────────────────

    /// Load the paper's questions, record the answer key and lay out timed sections.
    ///
    /// Returns the number of sections. With none, the session keeps running as one
    /// implicit section holding the whole time limit. Reloading mid-attempt keeps the
    /// time already spent; the instruction countdown is only armed on a fresh attempt.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or the question bank's error.
    pub async fn load_questions(
        &mut self,
        bank: &dyn QuestionBank,
        classifier: &dyn SectionClassifier,
    ) -> Result<usize, ControllerError> {
        let paper_id = self
            .session()
            .ok_or(ControllerError::NoActiveSession)?
            .paper_id()
            .clone();
        let questions = bank.questions_for_paper(&paper_id).await?;
        let instruction_seconds = self.gateway.settings().instruction_seconds;

        self.mutate(|active, now| {
            let plan = PlanBuilder::new(&active.session, classifier).build(questions);
            active.question_order = plan.question_order;
            active.ledger.set_answer_key(plan.answer_key);
            let count = plan.sections.len();
            if count > 0 {
                let fresh = active.timing.total_elapsed_ms(now) == 0;
                apply_sections(active, plan.sections, now)?;
                if fresh && instruction_seconds > 0 {
                    active.timing.set_section_instruction_timer(instruction_seconds, now);
                }
            }
            debug!(session_id = %active.session.id(), sections = count, "questions loaded");
            Ok(count)
        })
    }

    /// Replace the timed sections and derive their limits from question counts.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `TimingError::NoSections`.
    pub fn set_sections(&mut self, sections: Vec<SectionPlan>) -> Result<(), ControllerError> {
        self.mutate(|active, now| apply_sections(active, sections, now))
    }

    /// Change the question range, re-padding every per-question array.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidRange` and leaves everything untouched if invalid.
    pub fn update_question_range(&mut self, range: QuestionRange) -> Result<(), ControllerError> {
        self.mutate(|active, _| {
            active.session.set_question_range(range)?;
            let total = range.total();
            active.ledger.resize(total);
            active.question_order.resize(total, None);
            Ok(())
        })
    }

    // ─── Ledger ────────────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_answer(&mut self, index: usize, choice: impl Into<String>) -> Result<(), ControllerError> {
        let choice = choice.into();
        self.mutate(|a, _| Ok(a.ledger.set_answer(index, choice)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_other(&mut self, index: usize, text: impl Into<String>) -> Result<(), ControllerError> {
        let text = text.into();
        self.mutate(|a, _| Ok(a.ledger.set_other(index, text)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_correct_choice(&mut self, index: usize, choice: impl Into<String>) -> Result<(), ControllerError> {
        let choice = choice.into();
        self.mutate(|a, _| Ok(a.ledger.set_correct_choice(index, choice)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_explanation(&mut self, index: usize, text: impl Into<String>) -> Result<(), ControllerError> {
        let text = text.into();
        self.mutate(|a, _| Ok(a.ledger.set_explanation(index, text)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_add_to_drill(&mut self, index: usize, value: bool) -> Result<(), ControllerError> {
        self.mutate(|a, _| Ok(a.ledger.set_add_to_drill(index, value)?))
    }

    /// Marking a question wrong also enrolls it for drilling.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_correct_flag(&mut self, index: usize, flag: CorrectFlag) -> Result<(), ControllerError> {
        self.mutate(|a, _| Ok(a.ledger.set_correct_flag(index, flag)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_guessed_flag(&mut self, index: usize, value: bool) -> Result<(), ControllerError> {
        self.mutate(|a, _| Ok(a.ledger.set_guessed_flag(index, value)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_review_flag(&mut self, index: usize, value: bool) -> Result<(), ControllerError> {
        self.mutate(|a, _| Ok(a.ledger.set_review_flag(index, value)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_mistake_tag(&mut self, index: usize, tag: impl Into<String>) -> Result<(), ControllerError> {
        let tag = tag.into();
        self.mutate(|a, _| Ok(a.ledger.set_mistake_tag(index, tag)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_question_time(&mut self, index: usize, seconds: u32) -> Result<(), ControllerError> {
        self.mutate(|a, _| Ok(a.ledger.set_question_seconds(index, seconds)?))
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession`.
    pub fn set_notes(&mut self, notes: impl Into<String>) -> Result<(), ControllerError> {
        let notes = notes.into();
        self.mutate(|a, _| {
            a.session.set_notes(notes);
            Ok(())
        })
    }

    /// Remember the question on screen; only the local cache hears about it.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `LedgerError::IndexOutOfRange`.
    pub fn set_current_question(&mut self, index: usize) -> Result<(), ControllerError> {
        let now = self.clock.now();
        let active = self.active.as_mut().ok_or(ControllerError::NoActiveSession)?;
        let len = active.ledger.len();
        if index >= len {
            return Err(LedgerError::IndexOutOfRange { index, len }.into());
        }
        active.timing.set_last_question_index(index);
        self.cache_only(now);
        Ok(())
    }

    // ─── Timing ────────────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession`.
    pub fn set_section_instruction_timer(&mut self, seconds: u32) -> Result<(), ControllerError> {
        self.mutate(|a, now| {
            a.timing.set_section_instruction_timer(seconds, now);
            Ok(())
        })
    }

    /// # Errors
    ///
    /// Returns `ControllerError::NoActiveSession` or `TimingError::SectionOutOfRange`.
    pub fn set_current_section_index(&mut self, index: usize) -> Result<(), ControllerError> {
        self.mutate(|a, now| Ok(a.timing.set_current_section_index(index, now)?))
    }

    /// Freeze the clocks. Returns false without a session or when already paused.
    pub fn pause_session(&mut self) -> bool {
        let now = self.clock.now();
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if !active.timing.pause(now) {
            return false;
        }
        active.touch();
        info!(session_id = %active.session.id(), "session paused");
        self.schedule_sync(now);
        true
    }

    /// Restart the clocks and sync immediately. Returns `None` unless paused.
    pub fn resume_session(&mut self) -> Option<ResumeOutcome> {
        let now = self.clock.now();
        let active = self.active.as_mut()?;
        let outcome = active.timing.resume(now)?;
        active.touch();
        info!(session_id = %active.session.id(), ?outcome, "session resumed");
        self.sync_now(now);
        Some(outcome)
    }

    /// Reconcile the clocks with wall time. Safe to call any number of times.
    pub fn update_timer_state(&mut self) -> TimerTick {
        let now = self.clock.now();
        let Some(active) = self.active.as_mut().filter(|a| !a.session.is_ended()) else {
            return TimerTick::Idle;
        };
        let tick = active.timing.update_timer_state(now);
        match tick {
            TimerTick::Idle => {}
            TimerTick::SectionStarted { .. } => {
                active.touch();
                self.schedule_sync(now);
            }
            _ => self.cache_only(now),
        }
        tick
    }

    /// Periodic driver: reconciles the clocks, then advances past an expired section
    /// or ends the session after the last one.
    pub fn tick(&mut self) -> TimerTick {
        let tick = self.update_timer_state();
        if let TimerTick::SectionExpired { index } = tick {
            self.advance_after_expiry(index);
        }
        tick
    }

    // ─── Internals ─────────────────────────────────────────────────────────────

    fn mutate<T>(
        &mut self,
        apply: impl FnOnce(&mut ActiveSession, DateTime<Utc>) -> Result<T, ControllerError>,
    ) -> Result<T, ControllerError> {
        let now = self.clock.now();
        let active = self.active.as_mut().ok_or(ControllerError::NoActiveSession)?;
        let out = apply(active, now)?;
        active.touch();
        self.schedule_sync(now);
        Ok(out)
    }

    fn schedule_sync(&self, now: DateTime<Utc>) {
        if let Some(active) = &self.active {
            self.gateway.spawn_cache_write(active.to_local(now));
            self.gateway.schedule_persist(active.to_record());
        }
    }

    fn sync_now(&self, now: DateTime<Utc>) {
        if let Some(active) = &self.active {
            self.gateway.spawn_cache_write(active.to_local(now));
            self.gateway.cancel_scheduled(active.session.id());
            self.gateway.spawn_persist(active.to_record());
        }
    }

    fn cache_only(&self, now: DateTime<Utc>) {
        if let Some(active) = &self.active {
            self.gateway.spawn_cache_write(active.to_local(now));
        }
    }

    fn advance_after_expiry(&mut self, index: usize) {
        let now = self.clock.now();
        let instruction_seconds = self.gateway.settings().instruction_seconds;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let id = active.session.id();

        if active.timing.has_next_section() {
            if let Err(err) = active.timing.set_current_section_index(index + 1, now) {
                warn!(session_id = %id, %err, "could not advance to the next section");
                return;
            }
            if instruction_seconds > 0 {
                active.timing.set_section_instruction_timer(instruction_seconds, now);
            }
            active.touch();
            info!(session_id = %id, section = index + 1, "section time expired; advancing");
            self.schedule_sync(now);
            return;
        }

        active.session.set_ended_at(now);
        active.timing.pause(now);
        active.touch();
        let record = active.to_record();
        info!(session_id = %id, "time expired; session ended");
        self.gateway.spawn_cache_delete(id);
        self.gateway.cancel_scheduled(id);
        self.gateway.spawn_persist(record);
    }

    /// Push the outgoing session's pending edits before it is replaced.
    async fn flush_previous(&self) {
        if let Err(err) = self.gateway.flush_scheduled().await {
            warn!(%err, "could not flush the previous session");
        }
    }
}

fn apply_sections(
    active: &mut ActiveSession,
    sections: Vec<SectionPlan>,
    now: DateTime<Utc>,
) -> Result<(), ControllerError> {
    active.timing.replace_sections(sections, now)?;
    active.timing.calculate_section_time_limits(active.session.exam_family());
    // Re-arm so the current deadline reflects the derived limit.
    let current = active.timing.current_index();
    active.timing.set_current_section_index(current, now)?;
    Ok(())
}
