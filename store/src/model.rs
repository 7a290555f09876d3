use std::path::PathBuf;

use rtm_lib::{AppId, EnvId, Id, SubtaskId, SubtaskStatus, TaskStatus};
use serde_json::Value;

/// Everything a caller supplies to `createTask`, minus the already-generated
/// `taskId` and the opaque `appParams` blob.
#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub app_id: AppId,
    pub name: String,
    pub environment: EnvId,
    pub task_timeout_ms: u64,
    pub subtask_timeout_ms: u64,
    pub output_directory: PathBuf,
    pub resources: Vec<String>,
    pub max_subtasks: u32,
    pub max_price_per_hour: f64,
    pub consent_enabled: bool,
}

/// A `RequestedTask` row.
#[derive(Debug, Clone)]
pub struct RequestedTask {
    pub task_id: Id,
    pub app_id: AppId,
    pub name: String,
    pub environment: EnvId,
    pub task_timeout_ms: u64,
    pub subtask_timeout_ms: u64,
    pub max_subtasks: u32,
    pub max_price_per_hour: f64,
    pub output_directory: PathBuf,
    pub resources: Vec<String>,
    pub app_params: Value,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub consent_enabled: bool,
    pub status: TaskStatus,
}

/// Identity of a remote provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputingNode {
    pub node_id: Id,
    pub name: String,
}

/// A `RequestedSubtask` row.
#[derive(Debug, Clone)]
pub struct RequestedSubtask {
    pub task_id: Id,
    pub subtask_id: SubtaskId,
    pub payload: Value,
    pub inputs: Vec<String>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub price: f64,
    pub computing_node: ComputingNode,
    pub status: SubtaskStatus,
}

impl RequestedSubtask {
    pub fn deadline(&self, subtask_timeout_ms: u64) -> chrono::DateTime<chrono::Utc> {
        self.start_time + chrono::Duration::milliseconds(subtask_timeout_ms as i64)
    }
}
