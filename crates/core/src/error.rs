use thiserror::Error;

use crate::ledger::LedgerError;
use crate::model::SessionError;
use crate::timing::TimingError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Timing(#[from] TimingError),
}
