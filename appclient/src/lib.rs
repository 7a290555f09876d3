//! A reference `AppClient`: partitions a task into exactly `maxSubtasks`
//! numbered units of work and verifies them according to a fixed policy
//! chosen at construction time. RTM treats the App Client as an opaque
//! collaborator; this crate exists so the orchestration core has a real,
//! deterministic one to drive in tests and in the demo binary.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rtm_lib::{AppClient, AppClientError, AppClientFactory, Id, SubtaskDescriptor, SubtaskId, TaskApiService};
use serde_json::{json, Value};
use tracing::debug;

/// Whether a `PartitioningAppClient` reports its subtasks as verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPolicy {
    AlwaysSucceeds,
    AlwaysFails,
}

struct State {
    max_subtasks: u32,
    issued: u32,
    outstanding: HashSet<SubtaskId>,
}

/// An in-process App Client that hands out `subtask-0`, `subtask-1`, ... up
/// to `maxSubtasks`, and verifies according to a fixed `VerifyPolicy`.
pub struct PartitioningAppClient {
    state: Mutex<State>,
    verify_policy: VerifyPolicy,
    shutdown_calls: AtomicU32,
}

impl PartitioningAppClient {
    pub fn new(verify_policy: VerifyPolicy) -> Self {
        Self {
            state: Mutex::new(State { max_subtasks: 0, issued: 0, outstanding: HashSet::new() }),
            verify_policy,
            shutdown_calls: AtomicU32::new(0),
        }
    }

    pub fn shutdown_call_count(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AppClient for PartitioningAppClient {
    async fn create_task(&self, task_id: Id, max_subtasks: u32, _app_params: Value) -> Result<(), AppClientError> {
        let mut state = self.state.lock().unwrap();
        state.max_subtasks = max_subtasks;
        debug!(?task_id, max_subtasks, "app client created task");
        Ok(())
    }

    async fn has_pending_subtasks(&self, _task_id: Id) -> Result<bool, AppClientError> {
        let state = self.state.lock().unwrap();
        Ok(state.issued < state.max_subtasks)
    }

    async fn next_subtask(&self, task_id: Id) -> Result<SubtaskDescriptor, AppClientError> {
        let mut state = self.state.lock().unwrap();
        if state.issued >= state.max_subtasks {
            return Err(AppClientError::InvalidResponse("no subtasks remain".into()));
        }
        let subtask_id = format!("subtask-{}", state.issued);
        state.issued += 1;
        state.outstanding.insert(subtask_id.clone());
        debug!(?task_id, subtask_id, "app client issued subtask");
        Ok(SubtaskDescriptor { subtask_id, params: json!({}), resources: vec![] })
    }

    async fn verify(&self, task_id: Id, subtask_id: &SubtaskId) -> Result<bool, AppClientError> {
        let mut state = self.state.lock().unwrap();
        state.outstanding.remove(subtask_id);
        let result = self.verify_policy == VerifyPolicy::AlwaysSucceeds;
        debug!(?task_id, subtask_id, result, "app client verified subtask");
        Ok(result)
    }

    async fn shutdown(&self) -> Result<(), AppClientError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds a fresh `PartitioningAppClient` per `appId`, all sharing the same
/// verify policy.
pub struct PartitioningAppClientFactory {
    verify_policy: VerifyPolicy,
}

impl PartitioningAppClientFactory {
    pub fn new(verify_policy: VerifyPolicy) -> Self {
        Self { verify_policy }
    }
}

#[async_trait]
impl AppClientFactory for PartitioningAppClientFactory {
    async fn create(&self, _service: TaskApiService) -> Result<Arc<dyn AppClient>, AppClientError> {
        Ok(Arc::new(PartitioningAppClient::new(self.verify_policy)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_id() -> Id {
        Id::from_public_key(b"task")
    }

    #[tokio::test]
    async fn issues_exactly_max_subtasks() {
        let client = PartitioningAppClient::new(VerifyPolicy::AlwaysSucceeds);
        client.create_task(task_id(), 2, Value::Null).await.unwrap();
        assert!(client.has_pending_subtasks(task_id()).await.unwrap());
        client.next_subtask(task_id()).await.unwrap();
        assert!(client.has_pending_subtasks(task_id()).await.unwrap());
        client.next_subtask(task_id()).await.unwrap();
        assert!(!client.has_pending_subtasks(task_id()).await.unwrap());
    }

    #[tokio::test]
    async fn verify_policy_is_honoured() {
        let failing = PartitioningAppClient::new(VerifyPolicy::AlwaysFails);
        failing.create_task(task_id(), 1, Value::Null).await.unwrap();
        let descriptor = failing.next_subtask(task_id()).await.unwrap();
        assert!(!failing.verify(task_id(), &descriptor.subtask_id).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_is_counted() {
        let client = PartitioningAppClient::new(VerifyPolicy::AlwaysSucceeds);
        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        assert_eq!(client.shutdown_call_count(), 2);
    }
}
