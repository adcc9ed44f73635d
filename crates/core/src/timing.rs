//! Section pipeline and elapsed-time bookkeeping for a timed attempt.
//!
//! Each section runs `Instruction(i) -> Section(i)`. Only time spent in `Section` mode
//! while not paused is charged against a section's budget. Every operation takes the
//! current instant explicitly so the engine stays deterministic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ExamFamily, QuestionId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TimingError {
    #[error("section index {index} out of range for {len} sections")]
    SectionOutOfRange { index: usize, len: usize },
    #[error("timing pipeline needs at least one section")]
    NoSections,
}

//
// ─── SECTION PLAN ──────────────────────────────────────────────────────────────
//

/// One graded subdivision of the attempt with its own budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionPlan {
    pub label: String,
    pub question_ids: Vec<QuestionId>,
    pub time_limit_minutes: u32,
    /// Accumulated active time only; the running segment is tracked via `start_time`.
    pub elapsed_ms: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

impl SectionPlan {
    #[must_use]
    pub fn new(label: impl Into<String>, question_ids: Vec<QuestionId>, time_limit_minutes: u32) -> Self {
        Self {
            label: label.into(),
            question_ids,
            time_limit_minutes,
            elapsed_ms: 0,
            start_time: None,
            deadline: None,
        }
    }

    #[must_use]
    pub fn limit_ms(&self) -> i64 {
        i64::from(self.time_limit_minutes) * 60_000
    }

    fn remaining_ms(&self, extra_ms: i64) -> i64 {
        (self.limit_ms() - self.elapsed_ms - extra_ms).max(0)
    }
}

//
// ─── PIPELINE / PAUSE STATE ────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Instruction,
    Section,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub mode: PipelineMode,
    pub section_index: usize,
    pub instruction_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseState {
    pub is_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub last_active_timestamp: DateTime<Utc>,
}

/// Result of a periodic reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTick {
    /// Paused; nothing changed.
    Idle,
    Instruction { remaining: Duration },
    /// The instruction countdown ran out and the section clock started.
    SectionStarted { index: usize },
    Running { remaining: Duration },
    /// The current section has no time left.
    SectionExpired { index: usize },
}

/// What `resume` switched back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Instruction { remaining: Duration },
    Section { index: usize, question_index: usize },
}

//
// ─── ENGINE ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingEngine {
    sections: Vec<SectionPlan>,
    pipeline: PipelineState,
    pause: PauseState,
    frozen_instruction_ms: Option<i64>,
    last_question_index: usize,
}

impl TimingEngine {
    /// Build a pipeline whose first section starts running at `now`.
    ///
    /// # Errors
    ///
    /// Returns `TimingError::NoSections` if `sections` is empty.
    pub fn new(sections: Vec<SectionPlan>, now: DateTime<Utc>) -> Result<Self, TimingError> {
        if sections.is_empty() {
            return Err(TimingError::NoSections);
        }
        let mut engine = Self {
            sections,
            pipeline: PipelineState {
                mode: PipelineMode::Section,
                section_index: 0,
                instruction_deadline: None,
            },
            pause: PauseState {
                is_paused: false,
                paused_at: None,
                last_active_timestamp: now,
            },
            frozen_instruction_ms: None,
            last_question_index: 0,
        };
        engine.arm_current(now);
        Ok(engine)
    }

    /// A pipeline with one implicit section holding the whole time limit.
    #[must_use]
    pub fn single(
        question_ids: Vec<QuestionId>,
        time_limit_minutes: u32,
        elapsed_ms: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut plan = SectionPlan::new("All", question_ids, time_limit_minutes);
        plan.elapsed_ms = elapsed_ms.max(0);
        let mut engine = Self {
            sections: Vec::new(),
            pipeline: PipelineState {
                mode: PipelineMode::Section,
                section_index: 0,
                instruction_deadline: None,
            },
            pause: PauseState {
                is_paused: false,
                paused_at: None,
                last_active_timestamp: now,
            },
            frozen_instruction_ms: None,
            last_question_index: 0,
        };
        engine.sections.push(plan);
        engine.arm_current(now);
        engine
    }

    /// Swap in a new section list without losing time already spent.
    ///
    /// A new section inherits the elapsed time of the old section with the same label.
    /// When nothing matches and the old pipeline was a single section, its elapsed time
    /// moves to the first new section. The pipeline stays on the section with the
    /// current label, or the first one; mode and pause state are kept.
    ///
    /// # Errors
    ///
    /// Returns `TimingError::NoSections` if `sections` is empty.
    pub fn replace_sections(
        &mut self,
        mut sections: Vec<SectionPlan>,
        now: DateTime<Utc>,
    ) -> Result<(), TimingError> {
        if sections.is_empty() {
            return Err(TimingError::NoSections);
        }
        if self.is_running() {
            self.stop_running(now);
        }

        let mut carried = false;
        for old in &self.sections {
            if let Some(new) = sections.iter_mut().find(|s| s.label == old.label) {
                new.elapsed_ms = new.elapsed_ms.max(old.elapsed_ms);
                carried = true;
            }
        }
        if !carried {
            if let [only] = self.sections.as_slice() {
                sections[0].elapsed_ms += only.elapsed_ms;
            }
        }
        for section in &mut sections {
            section.start_time = None;
            section.deadline = None;
        }

        let current_label = self
            .sections
            .get(self.pipeline.section_index)
            .map(|s| s.label.clone());
        self.pipeline.section_index = current_label
            .and_then(|label| sections.iter().position(|s| s.label == label))
            .unwrap_or(0);
        self.sections = sections;
        self.arm_current(now);
        self.touch(now);
        Ok(())
    }

    /// Total active time across all sections, including the running segment.
    #[must_use]
    pub fn total_elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        self.section_elapsed_times(now).iter().sum()
    }

    #[must_use]
    pub fn sections(&self) -> &[SectionPlan] {
        &self.sections
    }

    #[must_use]
    pub fn pipeline(&self) -> &PipelineState {
        &self.pipeline
    }

    #[must_use]
    pub fn pause_state(&self) -> &PauseState {
        &self.pause
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.pipeline.section_index
    }

    #[must_use]
    pub fn has_next_section(&self) -> bool {
        self.pipeline.section_index + 1 < self.sections.len()
    }

    #[must_use]
    pub fn last_question_index(&self) -> usize {
        self.last_question_index
    }

    pub fn set_last_question_index(&mut self, index: usize) {
        self.last_question_index = index;
    }

    /// Accumulated time per section, including the running segment of the current one.
    #[must_use]
    pub fn section_elapsed_times(&self, now: DateTime<Utc>) -> Vec<i64> {
        let running = self.running_ms(now);
        self.sections
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if i == self.pipeline.section_index {
                    s.elapsed_ms + running
                } else {
                    s.elapsed_ms
                }
            })
            .collect()
    }

    /// Derive every section's time limit from its question count.
    pub fn calculate_section_time_limits(&mut self, family: ExamFamily) {
        for section in &mut self.sections {
            section.time_limit_minutes = family.section_time_limit_minutes(section.question_ids.len());
        }
    }

    // ─── Transitions ───────────────────────────────────────────────────────────

    /// Arm an instruction countdown for the current section.
    pub fn set_section_instruction_timer(&mut self, seconds: u32, now: DateTime<Utc>) {
        if self.is_running() {
            self.stop_running(now);
        }
        let countdown_ms = i64::from(seconds) * 1000;
        self.pipeline.mode = PipelineMode::Instruction;
        self.pipeline.instruction_deadline = Some(now + Duration::milliseconds(countdown_ms));
        self.frozen_instruction_ms = self.pause.is_paused.then_some(countdown_ms);
        self.touch(now);
    }

    /// Move to section `index`, banking the outgoing section's running time.
    ///
    /// # Errors
    ///
    /// Returns `TimingError::SectionOutOfRange` for an unknown section.
    pub fn set_current_section_index(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), TimingError> {
        if index >= self.sections.len() {
            return Err(TimingError::SectionOutOfRange {
                index,
                len: self.sections.len(),
            });
        }
        if self.is_running() {
            self.stop_running(now);
        }
        self.pipeline.section_index = index;
        self.arm_current(now);
        self.touch(now);
        Ok(())
    }

    /// End any instruction countdown and start the current section's clock.
    pub fn begin_section(&mut self, now: DateTime<Utc>) {
        self.pipeline.mode = PipelineMode::Section;
        self.pipeline.instruction_deadline = None;
        self.frozen_instruction_ms = None;
        self.arm_current(now);
        self.touch(now);
    }

    /// Freeze the clocks. Returns false if already paused.
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.pause.is_paused {
            return false;
        }
        match self.pipeline.mode {
            PipelineMode::Instruction => {
                let remaining = self
                    .pipeline
                    .instruction_deadline
                    .map_or(0, |deadline| (deadline - now).num_milliseconds().max(0));
                self.frozen_instruction_ms = Some(remaining);
            }
            PipelineMode::Section => self.stop_running(now),
        }
        self.pause.is_paused = true;
        self.pause.paused_at = Some(now);
        self.pause.last_active_timestamp = now;
        true
    }

    /// Restart the clocks. Paused wall time is never charged to either countdown.
    ///
    /// Returns `None` if not paused.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Option<ResumeOutcome> {
        if !self.pause.is_paused {
            return None;
        }
        self.pause.is_paused = false;
        self.pause.paused_at = None;
        self.pause.last_active_timestamp = now;

        let frozen = self.frozen_instruction_ms.take().unwrap_or(0);
        if self.pipeline.mode == PipelineMode::Instruction && frozen > 0 {
            self.pipeline.instruction_deadline = Some(now + Duration::milliseconds(frozen));
            return Some(ResumeOutcome::Instruction {
                remaining: Duration::milliseconds(frozen),
            });
        }

        self.begin_section(now);
        Some(ResumeOutcome::Section {
            index: self.pipeline.section_index,
            question_index: self.last_question_index,
        })
    }

    /// Periodic reconciliation; safe to call any number of times.
    pub fn update_timer_state(&mut self, now: DateTime<Utc>) -> TimerTick {
        if self.pause.is_paused {
            return TimerTick::Idle;
        }
        self.touch(now);
        match self.pipeline.mode {
            PipelineMode::Instruction => {
                let remaining_ms = self
                    .pipeline
                    .instruction_deadline
                    .map_or(0, |deadline| (deadline - now).num_milliseconds());
                if remaining_ms <= 0 {
                    self.begin_section(now);
                    TimerTick::SectionStarted {
                        index: self.pipeline.section_index,
                    }
                } else {
                    TimerTick::Instruction {
                        remaining: Duration::milliseconds(remaining_ms),
                    }
                }
            }
            PipelineMode::Section => {
                self.fold_running(now);
                let index = self.pipeline.section_index;
                let section = &mut self.sections[index];
                let remaining_ms = section.remaining_ms(0);
                section.deadline = Some(now + Duration::milliseconds(remaining_ms));
                if remaining_ms == 0 {
                    TimerTick::SectionExpired { index }
                } else {
                    TimerTick::Running {
                        remaining: Duration::milliseconds(remaining_ms),
                    }
                }
            }
        }
    }

    /// Freeze a pipeline restored after a reload at the last instant it was seen active.
    pub fn freeze_at_last_active(&mut self) {
        let at = self.pause.last_active_timestamp;
        self.pause(at);
    }

    // ─── Queries ───────────────────────────────────────────────────────────────

    /// Time left in section `index`.
    ///
    /// The current section reports its full limit while its instruction countdown runs.
    ///
    /// # Errors
    ///
    /// Returns `TimingError::SectionOutOfRange` for an unknown section.
    pub fn section_remaining_time(&self, index: usize, now: DateTime<Utc>) -> Result<Duration, TimingError> {
        let section = self.sections.get(index).ok_or(TimingError::SectionOutOfRange {
            index,
            len: self.sections.len(),
        })?;
        if index != self.pipeline.section_index {
            return Ok(Duration::milliseconds(section.remaining_ms(0)));
        }
        if self.pipeline.mode == PipelineMode::Instruction {
            return Ok(Duration::milliseconds(section.limit_ms()));
        }
        Ok(Duration::milliseconds(section.remaining_ms(self.running_ms(now))))
    }

    /// Remaining instruction countdown, or `None` outside instruction mode.
    #[must_use]
    pub fn instruction_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.pipeline.mode != PipelineMode::Instruction {
            return None;
        }
        let ms = match self.frozen_instruction_ms {
            Some(frozen) if self.pause.is_paused => frozen,
            _ => self
                .pipeline
                .instruction_deadline
                .map_or(0, |deadline| (deadline - now).num_milliseconds().max(0)),
        };
        Some(Duration::milliseconds(ms))
    }

    // ─── Internals ─────────────────────────────────────────────────────────────

    fn is_running(&self) -> bool {
        self.pipeline.mode == PipelineMode::Section && !self.pause.is_paused
    }

    fn running_ms(&self, now: DateTime<Utc>) -> i64 {
        if !self.is_running() {
            return 0;
        }
        self.sections[self.pipeline.section_index]
            .start_time
            .map_or(0, |start| (now - start).num_milliseconds().max(0))
    }

    fn fold_running(&mut self, now: DateTime<Utc>) {
        let running = self.running_ms(now);
        let section = &mut self.sections[self.pipeline.section_index];
        section.elapsed_ms += running;
        section.start_time = Some(now);
    }

    fn stop_running(&mut self, now: DateTime<Utc>) {
        self.fold_running(now);
        self.sections[self.pipeline.section_index].start_time = None;
    }

    fn arm_current(&mut self, now: DateTime<Utc>) {
        let section = &mut self.sections[self.pipeline.section_index];
        section.start_time = Some(now);
        section.deadline = Some(now + Duration::milliseconds(section.remaining_ms(0)));
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if !self.pause.is_paused {
            self.pause.last_active_timestamp = now;
        }
    }
}
