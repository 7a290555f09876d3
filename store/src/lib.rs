//! The Persistent Store: an ACID-capable local database holding
//! `RequestedTask` and `RequestedSubtask` rows plus a `ComputingNode`
//! lookup. Every method here is synchronous — local storage never
//! suspends under the RTM scheduling model — and the two operations that
//! need a single serialisable transaction (`try_insert_subtask`,
//! `finish_subtask`) are modelled as one trait method each rather than
//! separate read-then-write calls, so a backend can take its transaction
//! boundary around exactly one method invocation.

mod error;
mod mem;
mod model;
mod sqlite;

pub use error::StoreError;
pub use mem::InMemoryStore;
pub use model::{ComputingNode, CreateTaskParams, RequestedSubtask, RequestedTask};
pub use sqlite::SqliteStore;

use rtm_lib::{AppId, Id, SubtaskId, SubtaskStatus, TaskStatus};
use serde_json::Value;

/// Storage contract RTM depends on. Implementations must provide two
/// atomicity guarantees:
///
/// - `try_insert_subtask`: reading the outstanding-subtask count for
///   `(task_id, node_id)` and inserting the new row happen under one
///   serialisable transaction.
/// - `finish_subtask`: updating the subtask's terminal status and counting
///   finished subtasks (to decide whether the task also completes) happen
///   under one serialisable transaction.
pub trait Store: Send + Sync {
    /// Inserts a row with `status = creating`.
    fn create_task(&self, task_id: Id, params: CreateTaskParams, app_params: Value) -> Result<(), StoreError>;

    fn get_task(&self, task_id: Id) -> Result<RequestedTask, StoreError>;

    fn task_exists(&self, task_id: Id) -> Result<bool, StoreError>;

    /// Admission rule 4, evaluated standalone so callers can check it before
    /// doing anything side-effecting. Returns whether `node_id` already has
    /// a non-finished subtask on `task_id`. `try_insert_subtask` re-checks
    /// the same condition atomically at insert time; this method exists so
    /// a caller can refuse early, before it has committed to the work an
    /// insert would follow.
    fn outstanding_subtask_exists(&self, task_id: Id, node_id: Id) -> Result<bool, StoreError>;

    /// Transitions the task to `waiting` iff its current status `isPreparing()`.
    /// Returns whether the transition happened.
    fn start_task(&self, task_id: Id) -> Result<bool, StoreError>;

    fn set_task_status(&self, task_id: Id, status: TaskStatus) -> Result<(), StoreError>;

    /// Atomically checks that no subtask of `(task_id, node.node_id)` is
    /// outstanding (status not `finished`... actually "not finished" per
    /// admission rule 4 counts every non-finished status) and, if so,
    /// inserts a new `starting` subtask row. Returns `StoreError::OutstandingSubtaskExists`
    /// if the admission count is non-zero.
    fn try_insert_subtask(
        &self,
        task_id: Id,
        subtask_id: SubtaskId,
        node: ComputingNode,
        payload: Value,
        inputs: Vec<String>,
        price: f64,
    ) -> Result<RequestedSubtask, StoreError>;

    fn get_subtask(&self, task_id: Id, subtask_id: &SubtaskId) -> Result<RequestedSubtask, StoreError>;

    fn set_subtask_status(&self, task_id: Id, subtask_id: &SubtaskId, status: SubtaskStatus) -> Result<(), StoreError>;

    /// Sets the subtask to `finished` or `failure` and, only when `success`
    /// and the task's finished-subtask count has now reached `max_subtasks`,
    /// also transitions the task to `finished`. Returns whether the task
    /// transitioned to `finished` as part of this call.
    fn finish_subtask(&self, task_id: Id, subtask_id: &SubtaskId, success: bool) -> Result<bool, StoreError>;

    /// All subtasks of `task_id` whose status is active (`starting`,
    /// `downloading`, `verifying`). Used by `abortTask` to find what to cancel.
    fn active_subtasks(&self, task_id: Id) -> Result<Vec<RequestedSubtask>, StoreError>;

    /// Sets every active subtask of `task_id` to `cancelled`. Returns the
    /// rows that were cancelled (for timer bookkeeping).
    fn cancel_active_subtasks(&self, task_id: Id) -> Result<Vec<RequestedSubtask>, StoreError>;

    /// Count of tasks for `app_id` whose status is in
    /// `{sending, waiting, starting, computing}` — used by the App Client
    /// teardown sweep.
    fn count_active_tasks_for_app(&self, app_id: &AppId) -> Result<u64, StoreError>;
}
