use regsync_core::{PipelineError, UnitStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("work unit not found: {0}")]
    NotFound(i64),

    #[error("work unit {id} is {status}, expected running")]
    NotRunning { id: i64, status: UnitStatus },

    #[error("invalid ledger row: {0}")]
    InvalidRow(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl From<LedgerError> for PipelineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Pipeline(inner) => inner,
            LedgerError::Migrate(_) | LedgerError::InvalidRow(_) => PipelineError::FatalConfig(e.to_string()),
            other => PipelineError::Persistence(other.to_string()),
        }
    }
}
