use rtm_lib::{AppClientError, EnvId, Id, SubtaskId};
use rtm_store::StoreError;
use thiserror::Error;

/// The rule that failed during `getNextSubtask`'s admission check,
/// evaluated in order; the caller only ever sees the first one that is
/// violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRule {
    /// Rule 1: the task must exist.
    TaskMustExist,
    /// Rule 2: a provider may not be assigned its own requestor's work.
    NoSelfAssignment,
    /// Rule 3: the task must be active.
    TaskMustBeActive,
    /// Rule 4: the provider may not hold more than one outstanding subtask
    /// per task.
    NoOutstandingWork,
    /// Rule 5: the App Client must currently have pending subtasks.
    NoPendingSubtasks,
}

#[derive(Debug, Error)]
pub enum RtmError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    AppClient(#[from] AppClientError),

    #[error("initTask called on task {0} that is not in the creating state")]
    AlreadyInitialized(Id),

    #[error("startTask called on task {0} that is no longer preparing")]
    AlreadyStarted(Id),

    #[error("task {0} is not active")]
    TaskNotActive(Id),

    #[error("subtask {1} does not belong to task {0}")]
    SubtaskNotInTask(Id, SubtaskId),

    #[error("getNextSubtask refused for task {0}: {1:?}")]
    AssignmentRefused(Id, AdmissionRule),

    #[error("environment {0} is disabled")]
    EnvironmentDisabled(EnvId),
}

impl From<rtm_environment::EnvironmentError> for RtmError {
    fn from(err: rtm_environment::EnvironmentError) -> Self {
        match err {
            rtm_environment::EnvironmentError::Disabled(env_id) => RtmError::EnvironmentDisabled(env_id),
            other => RtmError::AppClient(AppClientError::InvalidResponse(other.to_string())),
        }
    }
}

impl From<rtm_directory::DirectoryError> for RtmError {
    fn from(err: rtm_directory::DirectoryError) -> Self {
        RtmError::Storage(StoreError::Backend(err.to_string()))
    }
}
