//! Per-question answer records and the scoring derived from them.

use thiserror::Error;

use crate::model::{CorrectFlag, QuestionAttempt};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("question index {index} out of range for {len} questions")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Mutable record set for every question of an attempt.
///
/// Attempts and the answer key always have the same length; `resize` pads or
/// truncates both together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnswerLedger {
    attempts: Vec<QuestionAttempt>,
    answer_key: Vec<Option<String>>,
}

impl AnswerLedger {
    /// Create a ledger with `total` unanswered questions and no answer key.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            attempts: vec![QuestionAttempt::default(); total],
            answer_key: vec![None; total],
        }
    }

    /// Rebuild a ledger from persisted attempts, padding the key to match.
    #[must_use]
    pub fn from_persisted(attempts: Vec<QuestionAttempt>, mut answer_key: Vec<Option<String>>) -> Self {
        answer_key.resize(attempts.len(), None);
        Self {
            attempts,
            answer_key,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    #[must_use]
    pub fn attempts(&self) -> &[QuestionAttempt] {
        &self.attempts
    }

    #[must_use]
    pub fn answer_key(&self) -> &[Option<String>] {
        &self.answer_key
    }

    /// Returns the attempt at `index`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` if `index` is past the end.
    pub fn get(&self, index: usize) -> Result<&QuestionAttempt, LedgerError> {
        self.attempts.get(index).ok_or(LedgerError::IndexOutOfRange {
            index,
            len: self.attempts.len(),
        })
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut QuestionAttempt, LedgerError> {
        let len = self.attempts.len();
        self.attempts
            .get_mut(index)
            .ok_or(LedgerError::IndexOutOfRange { index, len })
    }

    /// Pad or truncate every per-question array to `total` in lockstep.
    pub fn resize(&mut self, total: usize) {
        self.attempts.resize(total, QuestionAttempt::default());
        self.answer_key.resize(total, None);
    }

    /// Replace the canonical answers; missing entries are padded with `None`.
    pub fn set_answer_key(&mut self, mut key: Vec<Option<String>>) {
        key.resize(self.attempts.len(), None);
        self.answer_key = key;
    }

    // ─── Setters ───────────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_answer(&mut self, index: usize, choice: impl Into<String>) -> Result<(), LedgerError> {
        self.get_mut(index)?.choice = choice.into();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_other(&mut self, index: usize, text: impl Into<String>) -> Result<(), LedgerError> {
        self.get_mut(index)?.other_text = text.into();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_correct_choice(
        &mut self,
        index: usize,
        choice: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.get_mut(index)?.correct_choice_override = choice.into();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_explanation(
        &mut self,
        index: usize,
        explanation: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.get_mut(index)?.explanation = explanation.into();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_add_to_drill(&mut self, index: usize, value: bool) -> Result<(), LedgerError> {
        self.get_mut(index)?.add_to_drill = value;
        Ok(())
    }

    /// Record a hand-marked verdict. Marking a question wrong enrolls it in the drill pool.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_correct_flag(&mut self, index: usize, flag: CorrectFlag) -> Result<(), LedgerError> {
        let attempt = self.get_mut(index)?;
        attempt.correct_flag = flag;
        if flag == CorrectFlag::Explicit(false) {
            attempt.add_to_drill = true;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_guessed_flag(&mut self, index: usize, value: bool) -> Result<(), LedgerError> {
        self.get_mut(index)?.guessed_flag = value;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_review_flag(&mut self, index: usize, value: bool) -> Result<(), LedgerError> {
        self.get_mut(index)?.review_flag = value;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_mistake_tag(&mut self, index: usize, tag: impl Into<String>) -> Result<(), LedgerError> {
        self.get_mut(index)?.mistake_tag = tag.into();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn set_question_seconds(&mut self, index: usize, seconds: u32) -> Result<(), LedgerError> {
        self.get_mut(index)?.per_question_seconds = seconds;
        Ok(())
    }

    // ─── Scoring ───────────────────────────────────────────────────────────────

    /// Correctness of a question: `Some(true|false)`, or `None` when it cannot be known.
    ///
    /// An explicit flag always wins. Otherwise an unanswered question is wrong, and an
    /// answered one is compared case-insensitively against the effective correct choice.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::IndexOutOfRange` for an unknown question.
    pub fn derived_correct_flag(&self, index: usize) -> Result<Option<bool>, LedgerError> {
        let attempt = self.get(index)?;
        let canonical = self.answer_key.get(index).and_then(Option::as_deref);
        Ok(derive_correct(attempt, canonical))
    }

    /// Number of questions whose derived verdict is correct.
    #[must_use]
    pub fn correct_count(&self) -> usize {
        self.attempts
            .iter()
            .zip(&self.answer_key)
            .filter(|(attempt, key)| derive_correct(attempt, key.as_deref()) == Some(true))
            .count()
    }

    #[must_use]
    pub fn answered_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_answered()).count()
    }

    /// Positions of questions enrolled in the drill pool.
    #[must_use]
    pub fn drill_indices(&self) -> Vec<usize> {
        self.attempts
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.add_to_drill.then_some(i))
            .collect()
    }
}

fn derive_correct(attempt: &QuestionAttempt, canonical: Option<&str>) -> Option<bool> {
    if let Some(explicit) = attempt.correct_flag.explicit() {
        return Some(explicit);
    }
    if !attempt.is_answered() {
        return Some(false);
    }
    attempt
        .effective_correct_choice(canonical)
        .map(|expected| same_choice(expected, &attempt.choice))
}

/// Trimmed, Unicode case-insensitive comparison of two choices.
fn same_choice(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed_ledger() -> AnswerLedger {
        let mut ledger = AnswerLedger::new(5);
        ledger.set_answer_key(vec![
            Some("A".into()),
            Some("B".into()),
            Some("C".into()),
            Some("D".into()),
        ]);
        ledger
    }

    #[test]
    fn new_ledger_is_padded_with_defaults() {
        let ledger = AnswerLedger::new(20);
        assert_eq!(ledger.len(), 20);
        assert_eq!(ledger.answer_key().len(), 20);
        assert!(ledger.attempts().iter().all(|a| *a == QuestionAttempt::default()));
    }

    #[test]
    fn resize_keeps_arrays_in_lockstep() {
        let mut ledger = keyed_ledger();
        ledger.set_answer(4, "e").unwrap();
        ledger.resize(8);
        assert_eq!(ledger.attempts().len(), 8);
        assert_eq!(ledger.answer_key().len(), 8);
        assert_eq!(ledger.get(4).unwrap().choice, "e");
        ledger.resize(2);
        assert_eq!(ledger.attempts().len(), 2);
        assert_eq!(ledger.answer_key().len(), 2);
    }

    #[test]
    fn marking_wrong_enrolls_into_drill() {
        let mut ledger = AnswerLedger::new(3);
        ledger.set_correct_flag(0, CorrectFlag::Explicit(true)).unwrap();
        ledger.set_correct_flag(1, CorrectFlag::Unset).unwrap();
        ledger.set_correct_flag(2, CorrectFlag::Explicit(false)).unwrap();
        assert!(!ledger.get(0).unwrap().add_to_drill);
        assert!(!ledger.get(1).unwrap().add_to_drill);
        assert!(ledger.get(2).unwrap().add_to_drill);
        assert_eq!(ledger.drill_indices(), vec![2]);
    }

    #[test]
    fn unmarking_does_not_clear_drill() {
        let mut ledger = AnswerLedger::new(1);
        ledger.set_correct_flag(0, CorrectFlag::Explicit(false)).unwrap();
        ledger.set_correct_flag(0, CorrectFlag::Explicit(true)).unwrap();
        assert!(ledger.get(0).unwrap().add_to_drill);
    }

    #[test]
    fn derived_flag_compares_case_insensitively() {
        let mut ledger = keyed_ledger();
        ledger.set_answer(0, "a").unwrap();
        ledger.set_answer(1, "C").unwrap();
        assert_eq!(ledger.derived_correct_flag(0).unwrap(), Some(true));
        assert_eq!(ledger.derived_correct_flag(1).unwrap(), Some(false));
        // unanswered
        assert_eq!(ledger.derived_correct_flag(2).unwrap(), Some(false));
    }

    #[test]
    fn derived_flag_folds_non_ascii_letters() {
        let mut ledger = AnswerLedger::new(3);
        ledger.set_answer_key(vec![Some("Ä".into()), Some("Σ".into()), Some("б".into())]);
        ledger.set_answer(0, " ä ").unwrap();
        ledger.set_answer(1, "σ").unwrap();
        ledger.set_answer(2, "Б").unwrap();
        for index in 0..3 {
            assert_eq!(ledger.derived_correct_flag(index).unwrap(), Some(true));
        }
        ledger.set_answer(1, "S").unwrap();
        assert_eq!(ledger.derived_correct_flag(1).unwrap(), Some(false));
    }

    #[test]
    fn derived_flag_unknown_without_answer_key() {
        let mut ledger = keyed_ledger();
        ledger.set_answer(4, "A").unwrap();
        assert_eq!(ledger.derived_correct_flag(4).unwrap(), None);
        ledger.set_correct_choice(4, "a").unwrap();
        assert_eq!(ledger.derived_correct_flag(4).unwrap(), Some(true));
    }

    #[test]
    fn explicit_flag_overrides_derivation() {
        let mut ledger = keyed_ledger();
        ledger.set_answer(0, "A").unwrap();
        ledger.set_correct_flag(0, CorrectFlag::Explicit(false)).unwrap();
        assert_eq!(ledger.derived_correct_flag(0).unwrap(), Some(false));
        ledger.set_correct_flag(1, CorrectFlag::Explicit(true)).unwrap();
        assert_eq!(ledger.derived_correct_flag(1).unwrap(), Some(true));
    }

    #[test]
    fn correct_count_excludes_marked_wrong_guess() {
        let mut ledger = keyed_ledger();
        for (i, choice) in ["A", "B", "C", "D"].iter().enumerate() {
            ledger.set_answer(i, *choice).unwrap();
        }
        assert_eq!(ledger.correct_count(), 4);
        ledger.set_guessed_flag(3, true).unwrap();
        ledger.set_correct_flag(3, CorrectFlag::Explicit(false)).unwrap();
        assert_eq!(ledger.correct_count(), 3);
        assert!(ledger.get(3).unwrap().add_to_drill);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let mut ledger = AnswerLedger::new(2);
        assert_eq!(
            ledger.set_answer(2, "A").unwrap_err(),
            LedgerError::IndexOutOfRange { index: 2, len: 2 }
        );
    }
}
