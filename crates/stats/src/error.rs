use regsync_core::PipelineError;
use regsync_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid aggregate row: {0}")]
    InvalidRow(String),
}

impl From<StatsError> for PipelineError {
    fn from(e: StatsError) -> Self {
        match e {
            StatsError::Store(inner) => inner.into(),
            other => PipelineError::Persistence(other.to_string()),
        }
    }
}
