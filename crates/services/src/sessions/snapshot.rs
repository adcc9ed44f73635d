use chrono::{DateTime, Utc};
use exam_core::model::{QuestionAttempt, QuestionId, Session, SessionError};
use exam_core::{AnswerLedger, TimingEngine};
use storage::{AnswerRecord, LocalSnapshot, SessionRecord};

/// Everything the controller owns for the session being taken.
#[derive(Debug, Clone)]
pub(crate) struct ActiveSession {
    pub session: Session,
    pub ledger: AnswerLedger,
    pub timing: TimingEngine,
    pub question_order: Vec<Option<QuestionId>>,
    pub revision: u64,
}

impl ActiveSession {
    /// A fresh attempt timed as one implicit section until questions are loaded.
    pub fn start(session: Session, now: DateTime<Utc>) -> Self {
        let total = session.total_questions();
        let timing = TimingEngine::single(Vec::new(), session.time_limit_minutes(), 0, now);
        Self {
            ledger: AnswerLedger::new(total),
            timing,
            question_order: vec![None; total],
            revision: 1,
            session,
        }
    }

    pub fn touch(&mut self) {
        self.revision += 1;
    }

    pub fn to_record(&self) -> SessionRecord {
        let attempts = self.ledger.attempts();
        let session = &self.session;
        SessionRecord {
            id: session.id(),
            paper_id: session.paper_id().clone(),
            paper_name: session.paper_name().to_owned(),
            paper_variant: session.paper_variant().to_owned(),
            session_name: session.session_name().to_owned(),
            exam_family: session.exam_family(),
            question_range: session.question_range(),
            selected_sections: session.selected_sections().to_vec(),
            selected_part_ids: session.selected_part_ids().to_vec(),
            question_order: self.question_order.clone(),
            time_limit_minutes: session.time_limit_minutes(),
            started_at: session.started_at(),
            deadline_at: session.deadline(),
            ended_at: session.ended_at(),
            per_question_sec: attempts.iter().map(|a| a.per_question_seconds).collect(),
            answers: attempts
                .iter()
                .map(|a| AnswerRecord {
                    choice: a.choice.clone(),
                    other: a.other_text.clone(),
                    correct_choice: a.correct_choice_override.clone(),
                    explanation: a.explanation.clone(),
                    add_to_drill: a.add_to_drill,
                })
                .collect(),
            correct_flags: attempts.iter().map(|a| a.correct_flag.explicit()).collect(),
            guessed_flags: attempts.iter().map(|a| a.guessed_flag).collect(),
            review_flags: attempts.iter().map(|a| a.review_flag).collect(),
            mistake_tags: attempts.iter().map(|a| a.mistake_tag.clone()).collect(),
            answer_key: self.ledger.answer_key().to_vec(),
            notes: session.notes().to_owned(),
            score: u32::try_from(self.ledger.correct_count()).unwrap_or(u32::MAX),
            revision: self.revision,
        }
    }

    pub fn to_local(&self, saved_at: DateTime<Utc>) -> LocalSnapshot {
        LocalSnapshot {
            record: self.to_record(),
            timing: self.timing.clone(),
            current_question: self.timing.last_question_index(),
            saved_at,
        }
    }

    /// Rebuild from a local snapshot, timing state included.
    pub fn from_local(snapshot: LocalSnapshot) -> Result<Self, SessionError> {
        let LocalSnapshot {
            record,
            mut timing,
            current_question,
            ..
        } = snapshot;
        timing.set_last_question_index(current_question);
        let mut active = Self::from_record_parts(record, timing)?;
        active.timing.freeze_at_last_active();
        Ok(active)
    }

    /// Rebuild from the remote record alone. Timing restarts as one paused section
    /// charged with the wall time since the start, capped at the limit.
    pub fn from_remote(record: SessionRecord, now: DateTime<Utc>) -> Result<Self, SessionError> {
        let limit_ms = i64::from(record.time_limit_minutes) * 60_000;
        let reference = record.ended_at.unwrap_or(now);
        let elapsed_ms = (reference - record.started_at)
            .num_milliseconds()
            .clamp(0, limit_ms);
        let ids: Vec<QuestionId> = record.question_order.iter().flatten().cloned().collect();
        let mut timing = TimingEngine::single(ids, record.time_limit_minutes, elapsed_ms, now);
        timing.pause(now);
        Self::from_record_parts(record, timing)
    }

    fn from_record_parts(record: SessionRecord, timing: TimingEngine) -> Result<Self, SessionError> {
        let total = record.total_questions();
        let attempts: Vec<QuestionAttempt> = (0..total)
            .map(|i| {
                let answer = record.answers.get(i).cloned().unwrap_or_default();
                QuestionAttempt {
                    choice: answer.choice,
                    other_text: answer.other,
                    correct_choice_override: answer.correct_choice,
                    explanation: answer.explanation,
                    add_to_drill: answer.add_to_drill,
                    correct_flag: record.correct_flags.get(i).copied().flatten().into(),
                    guessed_flag: record.guessed_flags.get(i).copied().unwrap_or(false),
                    review_flag: record.review_flags.get(i).copied().unwrap_or(false),
                    mistake_tag: record.mistake_tags.get(i).cloned().unwrap_or_default(),
                    per_question_seconds: record.per_question_sec.get(i).copied().unwrap_or(0),
                }
            })
            .collect();
        let ledger = AnswerLedger::from_persisted(attempts, record.answer_key.clone());

        let mut question_order = record.question_order.clone();
        question_order.resize(total, None);

        let revision = record.revision;
        let session = Session::from_persisted(
            record.id,
            exam_core::model::SessionConfig {
                paper_id: record.paper_id,
                paper_name: record.paper_name,
                paper_variant: record.paper_variant,
                session_name: record.session_name,
                exam_family: record.exam_family,
                time_limit_minutes: record.time_limit_minutes,
                question_range: record.question_range,
                selected_sections: record.selected_sections,
                selected_part_ids: record.selected_part_ids,
            },
            record.started_at,
            record.ended_at,
            record.deadline_at,
            record.notes,
        )?;

        Ok(Self {
            session,
            ledger,
            timing,
            question_order,
            revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use exam_core::model::{CorrectFlag, PaperId, QuestionRange, SessionConfig, SessionId};
    use exam_core::time::fixed_now;

    fn active() -> ActiveSession {
        let config = SessionConfig::new(PaperId::new("paper-1"), QuestionRange { start: 5, end: 8 }, 30);
        let session = Session::start(SessionId::generate(), config, fixed_now()).unwrap();
        ActiveSession::start(session, fixed_now())
    }

    #[test]
    fn record_arrays_match_question_count() {
        let record = active().to_record();
        assert_eq!(record.total_questions(), 4);
        assert_eq!(record.answers.len(), 4);
        assert_eq!(record.correct_flags.len(), 4);
        assert_eq!(record.guessed_flags.len(), 4);
        assert_eq!(record.review_flags.len(), 4);
        assert_eq!(record.mistake_tags.len(), 4);
        assert_eq!(record.per_question_sec.len(), 4);
        assert_eq!(record.answer_key.len(), 4);
        assert_eq!(record.question_order.len(), 4);
        assert_eq!(record.revision, 1);
    }

    #[test]
    fn ledger_survives_record_round_trip() {
        let mut original = active();
        original.ledger.set_answer(1, "C").unwrap();
        original.ledger.set_correct_flag(2, CorrectFlag::Explicit(false)).unwrap();
        original.ledger.set_question_seconds(1, 42).unwrap();
        original.touch();

        let restored = ActiveSession::from_remote(original.to_record(), fixed_now()).unwrap();
        assert_eq!(restored.ledger.attempts(), original.ledger.attempts());
        assert_eq!(restored.revision, 2);
        assert!(restored.timing.is_paused());
    }

    #[test]
    fn remote_restore_charges_wall_time_up_to_the_limit() {
        let record = active().to_record();
        let later = fixed_now() + Duration::minutes(10);
        let restored = ActiveSession::from_remote(record.clone(), later).unwrap();
        let remaining = restored.timing.section_remaining_time(0, later).unwrap();
        assert_eq!(remaining, Duration::minutes(20));

        let much_later = fixed_now() + Duration::hours(3);
        let expired = ActiveSession::from_remote(record, much_later).unwrap();
        assert_eq!(
            expired.timing.section_remaining_time(0, much_later).unwrap(),
            Duration::zero()
        );
    }

    #[test]
    fn local_restore_freezes_at_last_activity() {
        let mut original = active();
        let seen = fixed_now() + Duration::minutes(5);
        original.timing.update_timer_state(seen);
        let snapshot = original.to_local(seen);

        let restored = ActiveSession::from_local(snapshot).unwrap();
        assert!(restored.timing.is_paused());
        assert_eq!(restored.timing.pause_state().paused_at, Some(seen));
        let much_later = seen + Duration::hours(1);
        assert_eq!(
            restored.timing.section_remaining_time(0, much_later).unwrap(),
            Duration::minutes(25)
        );
    }
}
