use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use rtm_lib::{AppId, Id, SubtaskId, SubtaskStatus, TaskStatus};
use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;
use crate::model::{ComputingNode, CreateTaskParams, RequestedSubtask, RequestedTask};
use crate::Store;

/// A process-local backend with no persistence across restarts. A single
/// mutex guarding plain `HashMap`s stands in for a transactional database,
/// since every method below takes the lock for its whole body and therefore
/// is trivially serialisable.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    db: Mutex<Db>,
}

#[derive(Debug, Default)]
struct Db {
    tasks: HashMap<Id, RequestedTask>,
    subtasks: HashMap<(Id, SubtaskId), RequestedSubtask>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for InMemoryStore {
    fn create_task(&self, task_id: Id, params: CreateTaskParams, app_params: Value) -> Result<(), StoreError> {
        let mut db = self.db.lock().unwrap();
        db.tasks.insert(
            task_id,
            RequestedTask {
                task_id,
                app_id: params.app_id,
                name: params.name,
                environment: params.environment,
                task_timeout_ms: params.task_timeout_ms,
                subtask_timeout_ms: params.subtask_timeout_ms,
                max_subtasks: params.max_subtasks,
                max_price_per_hour: params.max_price_per_hour,
                output_directory: params.output_directory,
                resources: params.resources,
                app_params,
                start_time: Utc::now(),
                consent_enabled: params.consent_enabled,
                status: TaskStatus::Creating,
            },
        );
        Ok(())
    }

    fn get_task(&self, task_id: Id) -> Result<RequestedTask, StoreError> {
        self.db
            .lock()
            .unwrap()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    fn task_exists(&self, task_id: Id) -> Result<bool, StoreError> {
        Ok(self.db.lock().unwrap().tasks.contains_key(&task_id))
    }

    fn start_task(&self, task_id: Id) -> Result<bool, StoreError> {
        let mut db = self.db.lock().unwrap();
        let task = db.tasks.get_mut(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;
        if !task.status.is_preparing() {
            return Ok(false);
        }
        task.status = TaskStatus::Waiting;
        Ok(true)
    }

    fn set_task_status(&self, task_id: Id, status: TaskStatus) -> Result<(), StoreError> {
        let mut db = self.db.lock().unwrap();
        let task = db.tasks.get_mut(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = status;
        Ok(())
    }

    fn outstanding_subtask_exists(&self, task_id: Id, node_id: Id) -> Result<bool, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(db
            .subtasks
            .values()
            .any(|s| s.task_id == task_id && s.computing_node.node_id == node_id && !s.status.is_finished()))
    }

    fn try_insert_subtask(
        &self,
        task_id: Id,
        subtask_id: SubtaskId,
        node: ComputingNode,
        payload: Value,
        inputs: Vec<String>,
        price: f64,
    ) -> Result<RequestedSubtask, StoreError> {
        let mut db = self.db.lock().unwrap();
        if !db.tasks.contains_key(&task_id) {
            return Err(StoreError::TaskNotFound(task_id));
        }
        let outstanding = db
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.computing_node.node_id == node.node_id && !s.status.is_finished())
            .count();
        if outstanding > 0 {
            return Err(StoreError::OutstandingSubtaskExists(task_id));
        }
        let subtask = RequestedSubtask {
            task_id,
            subtask_id: subtask_id.clone(),
            payload,
            inputs,
            start_time: Utc::now(),
            price,
            computing_node: node,
            status: SubtaskStatus::Starting,
        };
        db.subtasks.insert((task_id, subtask_id), subtask.clone());
        Ok(subtask)
    }

    fn get_subtask(&self, task_id: Id, subtask_id: &SubtaskId) -> Result<RequestedSubtask, StoreError> {
        self.db
            .lock()
            .unwrap()
            .subtasks
            .get(&(task_id, subtask_id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::SubtaskNotFound(task_id, subtask_id.clone()))
    }

    fn set_subtask_status(&self, task_id: Id, subtask_id: &SubtaskId, status: SubtaskStatus) -> Result<(), StoreError> {
        let mut db = self.db.lock().unwrap();
        let subtask = db
            .subtasks
            .get_mut(&(task_id, subtask_id.clone()))
            .ok_or_else(|| StoreError::SubtaskNotFound(task_id, subtask_id.clone()))?;
        subtask.status = status;
        Ok(())
    }

    fn finish_subtask(&self, task_id: Id, subtask_id: &SubtaskId, success: bool) -> Result<bool, StoreError> {
        let mut db = self.db.lock().unwrap();
        {
            let subtask = db
                .subtasks
                .get_mut(&(task_id, subtask_id.clone()))
                .ok_or_else(|| StoreError::SubtaskNotFound(task_id, subtask_id.clone()))?;
            subtask.status = if success { SubtaskStatus::Finished } else { SubtaskStatus::Failure };
        }
        if !success {
            return Ok(false);
        }
        let max_subtasks = db.tasks.get(&task_id).ok_or(StoreError::TaskNotFound(task_id))?.max_subtasks;
        let finished = db
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.status.is_finished())
            .count() as u32;
        if finished < max_subtasks {
            return Ok(false);
        }
        let task = db.tasks.get_mut(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Finished;
        Ok(true)
    }

    fn active_subtasks(&self, task_id: Id) -> Result<Vec<RequestedSubtask>, StoreError> {
        Ok(self
            .db
            .lock()
            .unwrap()
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.status.is_active())
            .cloned()
            .collect())
    }

    fn cancel_active_subtasks(&self, task_id: Id) -> Result<Vec<RequestedSubtask>, StoreError> {
        let mut db = self.db.lock().unwrap();
        let mut cancelled = Vec::new();
        for subtask in db.subtasks.values_mut() {
            if subtask.task_id == task_id && subtask.status.is_active() {
                subtask.status = SubtaskStatus::Cancelled;
                cancelled.push(subtask.clone());
            }
        }
        if cancelled.is_empty() {
            warn!(?task_id, "abortTask found no active subtasks to cancel");
        }
        Ok(cancelled)
    }

    fn count_active_tasks_for_app(&self, app_id: &AppId) -> Result<u64, StoreError> {
        Ok(self
            .db
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| &t.app_id == app_id && t.status.is_active())
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn params() -> CreateTaskParams {
        CreateTaskParams {
            app_id: "app".into(),
            name: "job".into(),
            environment: "env".into(),
            task_timeout_ms: 1000,
            subtask_timeout_ms: 1,
            output_directory: PathBuf::from("/tmp/out"),
            resources: vec![],
            max_subtasks: 1,
            max_price_per_hour: 1.0,
            consent_enabled: false,
        }
    }

    #[test]
    fn create_then_exists() {
        let store = InMemoryStore::new();
        let task_id = Id::from_public_key(b"k");
        store.create_task(task_id, params(), Value::Null).unwrap();
        assert!(store.task_exists(task_id).unwrap());
        assert!(!store.task_exists(Id::from_public_key(b"other")).unwrap());
    }

    #[test]
    fn start_task_once_then_refused() {
        let store = InMemoryStore::new();
        let task_id = Id::from_public_key(b"k");
        store.create_task(task_id, params(), Value::Null).unwrap();
        assert!(store.start_task(task_id).unwrap());
        assert!(!store.start_task(task_id).unwrap());
    }

    #[test]
    fn second_outstanding_subtask_for_same_node_is_refused() {
        let store = InMemoryStore::new();
        let task_id = Id::from_public_key(b"k");
        store.create_task(task_id, params(), Value::Null).unwrap();
        store.start_task(task_id).unwrap();
        let node = ComputingNode { node_id: Id::from_public_key(b"node"), name: "n".into() };
        store
            .try_insert_subtask(task_id, "s1".into(), node.clone(), Value::Null, vec![], 1.0)
            .unwrap();
        let err = store
            .try_insert_subtask(task_id, "s2".into(), node, Value::Null, vec![], 1.0)
            .unwrap_err();
        assert!(matches!(err, StoreError::OutstandingSubtaskExists(_)));
    }

    #[test]
    fn finish_subtask_completes_task_when_max_subtasks_reached() {
        let store = InMemoryStore::new();
        let task_id = Id::from_public_key(b"k");
        store.create_task(task_id, params(), Value::Null).unwrap();
        store.start_task(task_id).unwrap();
        let node = ComputingNode { node_id: Id::from_public_key(b"node"), name: "n".into() };
        store
            .try_insert_subtask(task_id, "s1".into(), node, Value::Null, vec![], 1.0)
            .unwrap();
        let completed = store.finish_subtask(task_id, &"s1".to_string(), true).unwrap();
        assert!(completed);
        assert_eq!(store.get_task(task_id).unwrap().status, TaskStatus::Finished);
    }

    #[test]
    fn finish_subtask_failure_does_not_complete_task() {
        let store = InMemoryStore::new();
        let task_id = Id::from_public_key(b"k");
        store.create_task(task_id, params(), Value::Null).unwrap();
        store.start_task(task_id).unwrap();
        let node = ComputingNode { node_id: Id::from_public_key(b"node"), name: "n".into() };
        store
            .try_insert_subtask(task_id, "s1".into(), node, Value::Null, vec![], 1.0)
            .unwrap();
        let completed = store.finish_subtask(task_id, &"s1".to_string(), false).unwrap();
        assert!(!completed);
        assert_eq!(store.get_task(task_id).unwrap().status, TaskStatus::Waiting);
    }

    #[test]
    fn cancel_active_subtasks_skips_terminal_ones() {
        let store = InMemoryStore::new();
        let task_id = Id::from_public_key(b"k");
        store.create_task(task_id, params(), Value::Null).unwrap();
        store.start_task(task_id).unwrap();
        let node = ComputingNode { node_id: Id::from_public_key(b"node"), name: "n".into() };
        store
            .try_insert_subtask(task_id, "s1".into(), node, Value::Null, vec![], 1.0)
            .unwrap();
        store.finish_subtask(task_id, &"s1".to_string(), true).unwrap();
        let cancelled = store.cancel_active_subtasks(task_id).unwrap();
        assert!(cancelled.is_empty());
    }
}
