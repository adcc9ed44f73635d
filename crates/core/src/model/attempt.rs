use serde::{Deserialize, Serialize};

//
// ─── CORRECT FLAG ──────────────────────────────────────────────────────────────
//

/// Whether a question's correctness was marked by hand.
///
/// `Unset` means correctness is derived from the stored choice and the answer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectFlag {
    #[default]
    Unset,
    Explicit(bool),
}

impl CorrectFlag {
    #[must_use]
    pub fn explicit(self) -> Option<bool> {
        match self {
            CorrectFlag::Unset => None,
            CorrectFlag::Explicit(value) => Some(value),
        }
    }
}

impl From<Option<bool>> for CorrectFlag {
    fn from(value: Option<bool>) -> Self {
        value.map_or(CorrectFlag::Unset, CorrectFlag::Explicit)
    }
}

impl From<CorrectFlag> for Option<bool> {
    fn from(flag: CorrectFlag) -> Self {
        flag.explicit()
    }
}

//
// ─── QUESTION ATTEMPT ──────────────────────────────────────────────────────────
//

/// Everything recorded against one question of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuestionAttempt {
    pub choice: String,
    pub other_text: String,
    /// Overrides the answer key when the user corrects it during review.
    pub correct_choice_override: String,
    pub explanation: String,
    pub add_to_drill: bool,
    pub correct_flag: CorrectFlag,
    pub guessed_flag: bool,
    pub review_flag: bool,
    pub mistake_tag: String,
    pub per_question_seconds: u32,
}

impl QuestionAttempt {
    #[must_use]
    pub fn is_answered(&self) -> bool {
        !self.choice.trim().is_empty()
    }

    /// The answer to grade against: the override if present, else the canonical answer.
    #[must_use]
    pub fn effective_correct_choice<'a>(&'a self, canonical: Option<&'a str>) -> Option<&'a str> {
        let override_choice = self.correct_choice_override.trim();
        if override_choice.is_empty() {
            canonical.map(str::trim).filter(|c| !c.is_empty())
        } else {
            Some(override_choice)
        }
    }
}
