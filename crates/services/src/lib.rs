#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod sessions;
pub mod sync;

pub use exam_core::Clock;

pub use config::SyncSettings;
pub use error::{ControllerError, PersistError};
pub use sessions::{PartNameClassifier, PlanBuilder, QuestionPlan, SectionClassifier, SessionController};
pub use sync::{PersistOutcome, PersistenceGateway, PersistenceTask, RetryPolicy, ScheduledTask, derive_drill_items};
