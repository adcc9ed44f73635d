//! Shared error types for the services crate.

use thiserror::Error;

use exam_core::model::{SessionError, SessionId};
use exam_core::{LedgerError, TimingError};
use storage::{RemoteError, StorageError};

/// Errors emitted by `PersistenceGateway` writes.
///
/// Transient failures never show up here: they are retried and then queued.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistError {
    #[error("remote store rejected the session: {0}")]
    Rejected(RemoteError),
    #[error(transparent)]
    Cache(#[from] StorageError),
}

/// Errors emitted by `SessionController`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    #[error("no active session")]
    NoActiveSession,
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {0} was abandoned moments ago")]
    RecentlyAbandoned(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
