use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rtm_lib::{AppId, Id, SubtaskId, SubtaskStatus, TaskStatus};
use rusqlite::{named_params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{ComputingNode, CreateTaskParams, RequestedSubtask, RequestedTask};
use crate::Store;

/// The durable backend. WAL mode, `NORMAL` synchronous, in-memory temp
/// store, and every multi-statement state transition wrapped in a single
/// `rusqlite::Transaction` for serialisability.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Creating => "creating",
        TaskStatus::Starting => "starting",
        TaskStatus::Sending => "sending",
        TaskStatus::Waiting => "waiting",
        TaskStatus::Computing => "computing",
        TaskStatus::Finished => "finished",
        TaskStatus::Aborted => "aborted",
        TaskStatus::Timeout => "timeout",
        TaskStatus::Failed => "failed",
    }
}

fn parse_task_status(s: &str) -> Result<TaskStatus, StoreError> {
    Ok(match s {
        "creating" => TaskStatus::Creating,
        "starting" => TaskStatus::Starting,
        "sending" => TaskStatus::Sending,
        "waiting" => TaskStatus::Waiting,
        "computing" => TaskStatus::Computing,
        "finished" => TaskStatus::Finished,
        "aborted" => TaskStatus::Aborted,
        "timeout" => TaskStatus::Timeout,
        "failed" => TaskStatus::Failed,
        other => return Err(StoreError::Corrupt(format!("unknown task status {other}"))),
    })
}

fn subtask_status_str(status: SubtaskStatus) -> &'static str {
    match status {
        SubtaskStatus::Starting => "starting",
        SubtaskStatus::Downloading => "downloading",
        SubtaskStatus::Verifying => "verifying",
        SubtaskStatus::Finished => "finished",
        SubtaskStatus::Failure => "failure",
        SubtaskStatus::Cancelled => "cancelled",
    }
}

fn parse_subtask_status(s: &str) -> Result<SubtaskStatus, StoreError> {
    Ok(match s {
        "starting" => SubtaskStatus::Starting,
        "downloading" => SubtaskStatus::Downloading,
        "verifying" => SubtaskStatus::Verifying,
        "finished" => SubtaskStatus::Finished,
        "failure" => SubtaskStatus::Failure,
        "cancelled" => SubtaskStatus::Cancelled,
        other => return Err(StoreError::Corrupt(format!("unknown subtask status {other}"))),
    })
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                name TEXT NOT NULL,
                environment TEXT NOT NULL,
                task_timeout_ms INTEGER NOT NULL,
                subtask_timeout_ms INTEGER NOT NULL,
                max_subtasks INTEGER NOT NULL,
                max_price_per_hour REAL NOT NULL,
                output_directory TEXT NOT NULL,
                resources TEXT NOT NULL,
                app_params TEXT NOT NULL,
                start_time TEXT NOT NULL,
                consent_enabled INTEGER NOT NULL,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS subtasks (
                task_id TEXT NOT NULL REFERENCES tasks(task_id),
                subtask_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                inputs TEXT NOT NULL,
                start_time TEXT NOT NULL,
                price REAL NOT NULL,
                node_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (task_id, subtask_id)
            );",
        )?;
        Ok(())
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Id, String, String, String, u64, u64, u32, f64, String, String, String, String, bool, String)> {
        Ok((
            row.get::<_, String>(0)?.parse().map_err(|_| rusqlite::Error::InvalidColumnType(0, "task_id".into(), rusqlite::types::Type::Text))?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get::<_, i64>(4)? as u64,
            row.get::<_, i64>(5)? as u64,
            row.get::<_, i64>(6)? as u32,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get::<_, i64>(12)? != 0,
            row.get(13)?,
        ))
    }

    fn materialize_task(tuple: (Id, String, String, String, u64, u64, u32, f64, String, String, String, String, bool, String)) -> Result<RequestedTask, StoreError> {
        let (task_id, app_id, name, environment, task_timeout_ms, subtask_timeout_ms, max_subtasks, max_price_per_hour, output_directory, resources, app_params, start_time, consent_enabled, status) = tuple;
        Ok(RequestedTask {
            task_id,
            app_id,
            name,
            environment,
            task_timeout_ms,
            subtask_timeout_ms,
            max_subtasks,
            max_price_per_hour,
            output_directory: PathBuf::from(output_directory),
            resources: serde_json::from_str(&resources).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            app_params: serde_json::from_str(&app_params).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            start_time: DateTime::parse_from_rfc3339(&start_time).map_err(|e| StoreError::Corrupt(e.to_string()))?.with_timezone(&Utc),
            consent_enabled,
            status: parse_task_status(&status)?,
        })
    }

    fn load_task(conn: &Connection, task_id: Id) -> Result<RequestedTask, StoreError> {
        let row = conn
            .query_row(
                "SELECT task_id, app_id, name, environment, task_timeout_ms, subtask_timeout_ms, max_subtasks,
                        max_price_per_hour, output_directory, resources, app_params, start_time, consent_enabled, status
                 FROM tasks WHERE task_id = ?1",
                [task_id.to_string()],
                Self::row_to_task,
            )
            .optional()?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        Self::materialize_task(row)
    }

    fn load_subtask(conn: &Connection, task_id: Id, subtask_id: &SubtaskId) -> Result<RequestedSubtask, StoreError> {
        conn.query_row(
            "SELECT task_id, subtask_id, payload, inputs, start_time, price, node_id, node_name, status
             FROM subtasks WHERE task_id = ?1 AND subtask_id = ?2",
            [task_id.to_string(), subtask_id.clone()],
            Self::row_to_subtask,
        )
        .optional()?
        .ok_or_else(|| StoreError::SubtaskNotFound(task_id, subtask_id.clone()))
    }

    fn row_to_subtask(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestedSubtask> {
        let task_id: String = row.get(0)?;
        let payload: String = row.get(2)?;
        let inputs: String = row.get(3)?;
        let start_time: String = row.get(4)?;
        let status: String = row.get(8)?;
        Ok(RequestedSubtask {
            task_id: task_id.parse().map_err(|_| rusqlite::Error::InvalidColumnType(0, "task_id".into(), rusqlite::types::Type::Text))?,
            subtask_id: row.get(1)?,
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            inputs: serde_json::from_str(&inputs).unwrap_or_default(),
            start_time: DateTime::parse_from_rfc3339(&start_time).unwrap_or_else(|_| Utc::now().into()).with_timezone(&Utc),
            price: row.get(5)?,
            computing_node: ComputingNode {
                node_id: row.get::<_, String>(6)?.parse().map_err(|_| rusqlite::Error::InvalidColumnType(6, "node_id".into(), rusqlite::types::Type::Text))?,
                name: row.get(7)?,
            },
            status: parse_subtask_status(&status).unwrap_or(SubtaskStatus::Starting),
        })
    }
}

impl Store for SqliteStore {
    fn create_task(&self, task_id: Id, params: CreateTaskParams, app_params: Value) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (task_id, app_id, name, environment, task_timeout_ms, subtask_timeout_ms,
                                 max_subtasks, max_price_per_hour, output_directory, resources, app_params,
                                 start_time, consent_enabled, status)
             VALUES (:task_id, :app_id, :name, :environment, :task_timeout_ms, :subtask_timeout_ms,
                     :max_subtasks, :max_price_per_hour, :output_directory, :resources, :app_params,
                     :start_time, :consent_enabled, :status)",
            named_params! {
                ":task_id": task_id.to_string(),
                ":app_id": params.app_id,
                ":name": params.name,
                ":environment": params.environment,
                ":task_timeout_ms": params.task_timeout_ms as i64,
                ":subtask_timeout_ms": params.subtask_timeout_ms as i64,
                ":max_subtasks": params.max_subtasks as i64,
                ":max_price_per_hour": params.max_price_per_hour,
                ":output_directory": params.output_directory.to_string_lossy(),
                ":resources": serde_json::to_string(&params.resources).unwrap(),
                ":app_params": serde_json::to_string(&app_params).unwrap(),
                ":start_time": Utc::now().to_rfc3339(),
                ":consent_enabled": params.consent_enabled as i64,
                ":status": task_status_str(TaskStatus::Creating),
            },
        )?;
        Ok(())
    }

    fn get_task(&self, task_id: Id) -> Result<RequestedTask, StoreError> {
        Self::load_task(&self.conn.lock().unwrap(), task_id)
    }

    fn task_exists(&self, task_id: Id) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row("SELECT 1 FROM tasks WHERE task_id = ?1", [task_id.to_string()], |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn start_task(&self, task_id: Id) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = Self::load_task(&tx, task_id)?;
        if !task.status.is_preparing() {
            return Ok(false);
        }
        tx.execute(
            "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
            [task_status_str(TaskStatus::Waiting), &task_id.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn set_task_status(&self, task_id: Id, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
            [task_status_str(status), &task_id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    fn outstanding_subtask_exists(&self, task_id: Id, node_id: Id) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let outstanding: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subtasks WHERE task_id = ?1 AND node_id = ?2 AND status != ?3",
            rusqlite::params![task_id.to_string(), node_id.to_string(), subtask_status_str(SubtaskStatus::Finished)],
            |row| row.get(0),
        )?;
        Ok(outstanding > 0)
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
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !tx
            .query_row("SELECT 1 FROM tasks WHERE task_id = ?1", [task_id.to_string()], |_| Ok(()))
            .optional()?
            .is_some()
        {
            return Err(StoreError::TaskNotFound(task_id));
        }
        let outstanding: i64 = tx.query_row(
            "SELECT COUNT(*) FROM subtasks WHERE task_id = ?1 AND node_id = ?2 AND status != ?3",
            rusqlite::params![task_id.to_string(), node.node_id.to_string(), subtask_status_str(SubtaskStatus::Finished)],
            |row| row.get(0),
        )?;
        if outstanding > 0 {
            return Err(StoreError::OutstandingSubtaskExists(task_id));
        }
        let start_time = Utc::now();
        tx.execute(
            "INSERT INTO subtasks (task_id, subtask_id, payload, inputs, start_time, price, node_id, node_name, status)
             VALUES (:task_id, :subtask_id, :payload, :inputs, :start_time, :price, :node_id, :node_name, :status)",
            named_params! {
                ":task_id": task_id.to_string(),
                ":subtask_id": subtask_id,
                ":payload": serde_json::to_string(&payload).unwrap(),
                ":inputs": serde_json::to_string(&inputs).unwrap(),
                ":start_time": start_time.to_rfc3339(),
                ":price": price,
                ":node_id": node.node_id.to_string(),
                ":node_name": node.name,
                ":status": subtask_status_str(SubtaskStatus::Starting),
            },
        )?;
        tx.commit()?;
        Ok(RequestedSubtask {
            task_id,
            subtask_id,
            payload,
            inputs,
            start_time,
            price,
            computing_node: node,
            status: SubtaskStatus::Starting,
        })
    }

    fn get_subtask(&self, task_id: Id, subtask_id: &SubtaskId) -> Result<RequestedSubtask, StoreError> {
        Self::load_subtask(&self.conn.lock().unwrap(), task_id, subtask_id)
    }

    fn set_subtask_status(&self, task_id: Id, subtask_id: &SubtaskId, status: SubtaskStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE subtasks SET status = ?1 WHERE task_id = ?2 AND subtask_id = ?3",
            [subtask_status_str(status), &task_id.to_string(), subtask_id],
        )?;
        if changed == 0 {
            return Err(StoreError::SubtaskNotFound(task_id, subtask_id.clone()));
        }
        Ok(())
    }

    fn finish_subtask(&self, task_id: Id, subtask_id: &SubtaskId, success: bool) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let new_status = if success { SubtaskStatus::Finished } else { SubtaskStatus::Failure };
        let changed = tx.execute(
            "UPDATE subtasks SET status = ?1 WHERE task_id = ?2 AND subtask_id = ?3",
            [subtask_status_str(new_status), &task_id.to_string(), subtask_id],
        )?;
        if changed == 0 {
            return Err(StoreError::SubtaskNotFound(task_id, subtask_id.clone()));
        }
        if !success {
            tx.commit()?;
            return Ok(false);
        }
        let max_subtasks: i64 = tx.query_row(
            "SELECT max_subtasks FROM tasks WHERE task_id = ?1",
            [task_id.to_string()],
            |row| row.get(0),
        )?;
        let finished: i64 = tx.query_row(
            "SELECT COUNT(*) FROM subtasks WHERE task_id = ?1 AND status = ?2",
            rusqlite::params![task_id.to_string(), subtask_status_str(SubtaskStatus::Finished)],
            |row| row.get(0),
        )?;
        if finished < max_subtasks {
            tx.commit()?;
            return Ok(false);
        }
        tx.execute(
            "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
            [task_status_str(TaskStatus::Finished), &task_id.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn active_subtasks(&self, task_id: Id) -> Result<Vec<RequestedSubtask>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, subtask_id, payload, inputs, start_time, price, node_id, node_name, status
             FROM subtasks WHERE task_id = ?1",
        )?;
        let rows = stmt.query_map([task_id.to_string()], Self::row_to_subtask)?;
        let mut out = Vec::new();
        for row in rows {
            let subtask = row?;
            if subtask.status.is_active() {
                out.push(subtask);
            }
        }
        Ok(out)
    }

    fn cancel_active_subtasks(&self, task_id: Id) -> Result<Vec<RequestedSubtask>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cancelled = {
            let mut stmt = tx.prepare(
                "SELECT task_id, subtask_id, payload, inputs, start_time, price, node_id, node_name, status
                 FROM subtasks WHERE task_id = ?1",
            )?;
            let rows = stmt.query_map([task_id.to_string()], Self::row_to_subtask)?;
            let mut out = Vec::new();
            for row in rows {
                let mut subtask = row?;
                if subtask.status.is_active() {
                    subtask.status = SubtaskStatus::Cancelled;
                    out.push(subtask);
                }
            }
            out
        };
        for subtask in &cancelled {
            tx.execute(
                "UPDATE subtasks SET status = ?1 WHERE task_id = ?2 AND subtask_id = ?3",
                [subtask_status_str(SubtaskStatus::Cancelled), &task_id.to_string(), &subtask.subtask_id],
            )?;
        }
        tx.commit()?;
        Ok(cancelled)
    }

    fn count_active_tasks_for_app(&self, app_id: &AppId) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status FROM tasks WHERE app_id = ?1")?;
        let rows = stmt.query_map([app_id], |row| row.get::<_, String>(0))?;
        let mut count = 0u64;
        for row in rows {
            if parse_task_status(&row?)?.is_active() {
                count += 1;
            }
        }
        Ok(count)
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
    fn create_then_load_round_trips_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task_id = Id::from_public_key(b"k");
        store.create_task(task_id, params(), Value::Null).unwrap();
        let task = store.get_task(task_id).unwrap();
        assert_eq!(task.app_id, "app");
        assert_eq!(task.status, TaskStatus::Creating);
        assert_eq!(task.max_subtasks, 1);
    }

    #[test]
    fn outstanding_subtask_blocks_second_assignment() {
        let store = SqliteStore::open_in_memory().unwrap();
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
    fn finish_subtask_transitions_task_to_finished_at_max_subtasks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task_id = Id::from_public_key(b"k");
        store.create_task(task_id, params(), Value::Null).unwrap();
        store.start_task(task_id).unwrap();
        let node = ComputingNode { node_id: Id::from_public_key(b"node"), name: "n".into() };
        store
            .try_insert_subtask(task_id, "s1".into(), node, Value::Null, vec![], 1.0)
            .unwrap();
        assert!(store.finish_subtask(task_id, &"s1".to_string(), true).unwrap());
        assert_eq!(store.get_task(task_id).unwrap().status, TaskStatus::Finished);
    }
}
