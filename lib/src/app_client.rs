//! The App Client contract. RTM depends only on this trait; the real
//! network-backed transport is an external collaborator out of scope for
//! this crate.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::id::{EnvId, Id, SubtaskId};

#[derive(Debug, Error)]
pub enum AppClientError {
    #[error("app client transport error: {0}")]
    Transport(String),

    #[error("app client returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("environment {0} is disabled")]
    EnvironmentDisabled(EnvId),
}

/// A freshly minted unit of work, as handed back by `nextSubtask`.
#[derive(Debug, Clone)]
pub struct SubtaskDescriptor {
    pub subtask_id: SubtaskId,
    pub params: Value,
    pub resources: Vec<String>,
}

/// Verbs RTM calls on a per-application App Client.
#[async_trait]
pub trait AppClient: Send + Sync {
    async fn create_task(
        &self,
        task_id: Id,
        max_subtasks: u32,
        app_params: Value,
    ) -> Result<(), AppClientError>;

    async fn has_pending_subtasks(&self, task_id: Id) -> Result<bool, AppClientError>;

    async fn next_subtask(&self, task_id: Id) -> Result<SubtaskDescriptor, AppClientError>;

    async fn verify(&self, task_id: Id, subtask_id: &SubtaskId) -> Result<bool, AppClientError>;

    /// Not assumed idempotent — RTM must not call it twice.
    async fn shutdown(&self) -> Result<(), AppClientError>;
}

/// The bundle the Environment Manager hands to an `AppClientFactory`:
/// environment + payload builder output + environment-specific
/// prerequisites + the task's directories.
#[derive(Debug, Clone)]
pub struct TaskApiService {
    pub env_id: EnvId,
    pub prerequisites: Value,
    pub resources_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub temp_dir: PathBuf,
}

/// Builds the environment-specific prerequisites blob folded into a
/// `TaskApiService`. One implementation per environment.
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, env_id: &EnvId) -> Value;
}

/// Constructs a concrete `AppClient` from a bound `TaskApiService`
/// (the `create(service) -> AppClient` async constructor).
#[async_trait]
pub trait AppClientFactory: Send + Sync {
    async fn create(&self, service: TaskApiService) -> Result<Arc<dyn AppClient>, AppClientError>;
}
