//! Remote persistence pipeline: debounced writes, backoff, outbox, drill items.

mod backoff;
mod drill;
mod gateway;
mod outbox;
mod scheduler;

pub use backoff::RetryPolicy;
pub use drill::derive_drill_items;
pub use gateway::{PersistOutcome, PersistenceGateway};
pub use outbox::PersistenceTask;
pub use scheduler::ScheduledTask;
