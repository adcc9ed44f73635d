mod controller;
mod plan;
mod snapshot;

// Public API of the session subsystem.
pub use crate::error::ControllerError;
pub use controller::SessionController;
pub use plan::{PartNameClassifier, PlanBuilder, QuestionPlan, SectionClassifier};
