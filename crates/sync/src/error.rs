use regsync_core::PipelineError;
use regsync_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sync run not found: {0}")]
    RunNotFound(Uuid),

    #[error("changeset not found: {0}")]
    ChangesetNotFound(String),

    #[error("changeset already written: {0}")]
    ChangesetExists(String),

    /// A fact listener fell behind the store.
    #[error("{0}")]
    ListenerFailed(String),

    #[error("invalid sync run row: {0}")]
    InvalidRow(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Pipeline(PipelineError::Io(e))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Pipeline(PipelineError::Serialize(e))
    }
}

impl From<SyncError> for PipelineError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Pipeline(inner) => inner,
            SyncError::Store(inner) => inner.into(),
            SyncError::ChangesetNotFound(_) | SyncError::ChangesetExists(_) | SyncError::InvalidRow(_) => {
                PipelineError::FatalConfig(e.to_string())
            }
            other => PipelineError::Persistence(other.to_string()),
        }
    }
}
