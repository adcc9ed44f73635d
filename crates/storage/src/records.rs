//! Persisted shapes for sessions, drill items and local snapshots.
//!
//! These mirror the domain so adapters can serialize/deserialize without leaking
//! storage concerns into `exam-core`. Every record is a full snapshot, never a diff.

use chrono::{DateTime, Utc};
use exam_core::TimingEngine;
use exam_core::model::{ExamFamily, PaperId, QuestionId, QuestionRange, SessionId};
use serde::{Deserialize, Serialize};

/// Per-question answer fields as sent to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub choice: String,
    pub other: String,
    pub correct_choice: String,
    pub explanation: String,
    pub add_to_drill: bool,
}

/// Full remote snapshot of one attempt (`POST`/`PATCH /sessions`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    pub paper_id: PaperId,
    pub paper_name: String,
    pub paper_variant: String,
    pub session_name: String,
    #[serde(default)]
    pub exam_family: ExamFamily,
    pub question_range: QuestionRange,
    pub selected_sections: Vec<String>,
    pub selected_part_ids: Vec<String>,
    /// Question ids aligned with range positions; `None` where the bank had no record.
    pub question_order: Vec<Option<QuestionId>>,
    pub time_limit_minutes: u32,
    pub started_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub per_question_sec: Vec<u32>,
    pub answers: Vec<AnswerRecord>,
    pub correct_flags: Vec<Option<bool>>,
    pub guessed_flags: Vec<bool>,
    pub review_flags: Vec<bool>,
    pub mistake_tags: Vec<String>,
    #[serde(default)]
    pub answer_key: Vec<Option<String>>,
    pub notes: String,
    pub score: u32,
    /// Monotonic per-session edit counter; higher always means newer.
    #[serde(default)]
    pub revision: u64,
}

impl SessionRecord {
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    #[must_use]
    pub fn total_questions(&self) -> usize {
        self.question_range.total()
    }
}

/// One missed question surfaced later for review (`POST /drill-items`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillItemRecord {
    pub paper_id: PaperId,
    pub paper_name: String,
    pub question_number: u32,
    pub correct_choice: Option<String>,
    pub explanation: String,
    pub origin_session_id: SessionId,
    pub question_id: Option<QuestionId>,
    pub last_wrong_at: DateTime<Utc>,
    pub last_time_sec: u32,
}

/// Local crash/reload snapshot: the remote record plus live timing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    pub record: SessionRecord,
    pub timing: TimingEngine,
    pub current_question: usize,
    pub saved_at: DateTime<Utc>,
}

impl LocalSnapshot {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.record.id
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.record.revision
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.timing.is_paused()
    }

    #[must_use]
    pub fn paused_at(&self) -> Option<DateTime<Utc>> {
        self.timing.pause_state().paused_at
    }

    #[must_use]
    pub fn last_active_timestamp(&self) -> DateTime<Utc> {
        self.timing.pause_state().last_active_timestamp
    }

    /// Banked active time per section as of the last activity.
    #[must_use]
    pub fn section_elapsed_times(&self) -> Vec<i64> {
        self.timing.section_elapsed_times(self.last_active_timestamp())
    }
}
