use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{PaperId, SessionId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("invalid question range {start}..={end}: start must be >= 1 and <= end")]
    InvalidRange { start: u32, end: u32 },
}

//
// ─── QUESTION RANGE ────────────────────────────────────────────────────────────
//

/// Inclusive, 1-based range of question numbers covered by an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRange {
    pub start: u32,
    pub end: u32,
}

impl QuestionRange {
    /// Build a validated range.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidRange` if `start < 1` or `end < start`.
    pub fn new(start: u32, end: u32) -> Result<Self, SessionError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// # Errors
    ///
    /// Returns `SessionError::InvalidRange` if `start < 1` or `end < start`.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.start < 1 || self.end < self.start {
            return Err(SessionError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Number of questions in the range. Only meaningful for validated ranges.
    #[must_use]
    pub fn total(&self) -> usize {
        (self.end.saturating_sub(self.start) as usize) + 1
    }

    #[must_use]
    pub fn contains(&self, number: u32) -> bool {
        (self.start..=self.end).contains(&number)
    }

    /// Position of a question number within the range.
    #[must_use]
    pub fn index_of(&self, number: u32) -> Option<usize> {
        self.contains(number)
            .then(|| (number - self.start) as usize)
    }

    /// Question number for a position within the range.
    #[must_use]
    pub fn number_at(&self, index: usize) -> u32 {
        self.start
            .saturating_add(u32::try_from(index).unwrap_or(u32::MAX))
    }
}

//
// ─── EXAM FAMILY ───────────────────────────────────────────────────────────────
//

/// Minutes granted to each section of a fixed-timer exam.
pub const FIXED_SECTION_MINUTES: u32 = 75;

/// Seconds granted per question when sections are timed by question count.
pub const SECONDS_PER_QUESTION: u32 = 90;

/// Exam families differ in how section time limits are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamFamily {
    /// Sections are timed at 1.5 minutes per question, rounded up.
    #[default]
    Standard,
    /// Every section gets the same fixed budget.
    FixedTimer,
}

impl ExamFamily {
    /// Time limit in whole minutes for a section with `question_count` questions.
    #[must_use]
    pub fn section_time_limit_minutes(self, question_count: usize) -> u32 {
        match self {
            ExamFamily::FixedTimer => FIXED_SECTION_MINUTES,
            ExamFamily::Standard => {
                let count = u32::try_from(question_count).unwrap_or(u32::MAX);
                count.saturating_mul(SECONDS_PER_QUESTION).div_ceil(60)
            }
        }
    }
}

//
// ─── SESSION ───────────────────────────────────────────────────────────────────
//

/// User choices for a new attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub paper_id: PaperId,
    pub paper_name: String,
    pub paper_variant: String,
    pub session_name: String,
    pub exam_family: ExamFamily,
    pub time_limit_minutes: u32,
    pub question_range: QuestionRange,
    pub selected_sections: Vec<String>,
    pub selected_part_ids: Vec<String>,
}

impl SessionConfig {
    /// Minimal configuration for a paper; callers fill in the rest with struct update syntax.
    #[must_use]
    pub fn new(paper_id: PaperId, question_range: QuestionRange, time_limit_minutes: u32) -> Self {
        Self {
            paper_name: paper_id.as_str().to_owned(),
            paper_id,
            paper_variant: String::new(),
            session_name: String::new(),
            exam_family: ExamFamily::default(),
            time_limit_minutes,
            question_range,
            selected_sections: Vec::new(),
            selected_part_ids: Vec::new(),
        }
    }
}

/// Identity and lifecycle of a single timed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    paper_id: PaperId,
    paper_name: String,
    paper_variant: String,
    session_name: String,
    exam_family: ExamFamily,
    time_limit_minutes: u32,
    question_range: QuestionRange,
    selected_sections: Vec<String>,
    selected_part_ids: Vec<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    deadline: DateTime<Utc>,
    notes: String,
}

impl Session {
    /// Start a session from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidRange` if the question range is invalid.
    pub fn start(
        id: SessionId,
        config: SessionConfig,
        started_at: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        config.question_range.validate()?;
        let deadline = started_at + Duration::minutes(i64::from(config.time_limit_minutes));
        Ok(Self {
            id,
            paper_id: config.paper_id,
            paper_name: config.paper_name,
            paper_variant: config.paper_variant,
            session_name: config.session_name,
            exam_family: config.exam_family,
            time_limit_minutes: config.time_limit_minutes,
            question_range: config.question_range,
            selected_sections: config.selected_sections,
            selected_part_ids: config.selected_part_ids,
            started_at,
            ended_at: None,
            deadline,
            notes: String::new(),
        })
    }

    /// Rehydrate a session from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidRange` if the stored range is invalid.
    pub fn from_persisted(
        id: SessionId,
        config: SessionConfig,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
        deadline: DateTime<Utc>,
        notes: String,
    ) -> Result<Self, SessionError> {
        let mut session = Self::start(id, config, started_at)?;
        session.ended_at = ended_at;
        session.deadline = deadline;
        session.notes = notes;
        Ok(session)
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn paper_id(&self) -> &PaperId {
        &self.paper_id
    }

    #[must_use]
    pub fn paper_name(&self) -> &str {
        &self.paper_name
    }

    #[must_use]
    pub fn paper_variant(&self) -> &str {
        &self.paper_variant
    }

    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    #[must_use]
    pub fn exam_family(&self) -> ExamFamily {
        self.exam_family
    }

    #[must_use]
    pub fn time_limit_minutes(&self) -> u32 {
        self.time_limit_minutes
    }

    #[must_use]
    pub fn question_range(&self) -> QuestionRange {
        self.question_range
    }

    #[must_use]
    pub fn selected_sections(&self) -> &[String] {
        &self.selected_sections
    }

    #[must_use]
    pub fn selected_part_ids(&self) -> &[String] {
        &self.selected_part_ids
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    #[must_use]
    pub fn notes(&self) -> &str {
        &self.notes
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    #[must_use]
    pub fn total_questions(&self) -> usize {
        self.question_range.total()
    }

    /// Returns true when both sessions target the same paper and variant.
    #[must_use]
    pub fn same_paper(&self, paper_id: &PaperId, paper_variant: &str) -> bool {
        &self.paper_id == paper_id && self.paper_variant == paper_variant
    }

    /// Rebuild the configuration this session was started with.
    #[must_use]
    pub fn config(&self) -> SessionConfig {
        SessionConfig {
            paper_id: self.paper_id.clone(),
            paper_name: self.paper_name.clone(),
            paper_variant: self.paper_variant.clone(),
            session_name: self.session_name.clone(),
            exam_family: self.exam_family,
            time_limit_minutes: self.time_limit_minutes,
            question_range: self.question_range,
            selected_sections: self.selected_sections.clone(),
            selected_part_ids: self.selected_part_ids.clone(),
        }
    }

    pub fn set_ended_at(&mut self, at: DateTime<Utc>) {
        self.ended_at = Some(at);
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.notes = notes.into();
    }

    /// Replace the question range.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidRange` and leaves the session untouched if invalid.
    pub fn set_question_range(&mut self, range: QuestionRange) -> Result<(), SessionError> {
        range.validate()?;
        self.question_range = range;
        Ok(())
    }
}
