use rtm_lib::{Id, SubtaskId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(Id),

    #[error("subtask {1} not found in task {0}")]
    SubtaskNotFound(Id, SubtaskId),

    #[error("provider already has an outstanding subtask for task {0}")]
    OutstandingSubtaskExists(Id),

    #[error("underlying database error: {0}")]
    Backend(String),

    #[error("malformed row data: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}
