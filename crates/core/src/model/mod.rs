mod attempt;
mod ids;
mod session;

pub use ids::{PaperId, ParseIdError, QuestionId, SessionId};

pub use attempt::{CorrectFlag, QuestionAttempt};
pub use session::{
    ExamFamily, FIXED_SECTION_MINUTES, QuestionRange, SECONDS_PER_QUESTION, Session, SessionConfig,
    SessionError,
};
