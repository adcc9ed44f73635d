#![forbid(unsafe_code)]

pub mod error;
pub mod ledger;
pub mod model;
pub mod time;
pub mod timing;

pub use error::Error;
pub use ledger::{AnswerLedger, LedgerError};
pub use time::Clock;
pub use timing::{
    PauseState, PipelineMode, PipelineState, ResumeOutcome, SectionPlan, TimerTick, TimingEngine,
    TimingError,
};
