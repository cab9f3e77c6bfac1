use regsync_core::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored value: {0}")]
    Invalid(String),

    #[error("record {id} rejected: {reason}")]
    Rejected { id: String, reason: String },
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        PipelineError::Persistence(e.to_string())
    }
}
