//! The Requested Task Manager itself: coordinates the Persistent Store,
//! Directory Manager, Environment Manager / Task API Service Factory, and
//! per-application App Clients. Shaped as a thin public facade delegating
//! to synchronized internal state, with the concurrency primitive being the
//! `AppClientMap` single-flight cell rather than a queue — RTM answers
//! calls directly instead of scheduling them.

use std::path::PathBuf;
use std::sync::Arc;

use rtm_directory::DirectoryManager;
use rtm_environment::{EnvironmentManager, TaskApiServiceFactory};
use rtm_lib::{
    AppClient, AppClientFactory, AppId, EnvId, Id, ProviderComputeTimers, SubtaskId, TaskStatus,
};
use rtm_store::{ComputingNode, CreateTaskParams, Store};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app_client_map::AppClientMap;
use crate::error::{AdmissionRule, RtmError};

/// The value returned from a successful `getNextSubtask` call.
#[derive(Debug, Clone)]
pub struct SubtaskDefinition {
    pub subtask_id: SubtaskId,
    pub resources: Vec<String>,
    pub params: Value,
    pub deadline: chrono::DateTime<chrono::Utc>,
}

pub struct RequestedTaskManager {
    public_key: Vec<u8>,
    store: Arc<dyn Store>,
    directory: DirectoryManager,
    service_factory: TaskApiServiceFactory,
    app_client_factory: Arc<dyn AppClientFactory>,
    app_clients: AppClientMap,
    timers: Arc<dyn ProviderComputeTimers>,
}

impl RequestedTaskManager {
    pub fn new(
        public_key: Vec<u8>,
        root_path: impl Into<PathBuf>,
        environment_manager: Arc<dyn EnvironmentManager>,
        app_client_factory: Arc<dyn AppClientFactory>,
        store: Arc<dyn Store>,
        timers: Arc<dyn ProviderComputeTimers>,
    ) -> Self {
        Self {
            public_key,
            store,
            directory: DirectoryManager::new(root_path),
            service_factory: TaskApiServiceFactory::new(environment_manager),
            app_client_factory,
            app_clients: AppClientMap::new(),
            timers,
        }
    }

    /// Synchronous; never contacts the App Client.
    pub fn create_task(&self, params: CreateTaskParams, app_params: Value) -> Result<Id, RtmError> {
        let disambiguator = format!("{}-{}", params.app_id, chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let task_id = Id::derive(&self.public_key, disambiguator.as_bytes());
        self.store.create_task(task_id, params, app_params)?;
        Ok(task_id)
    }

    /// May suspend around App Client acquisition and around `createTask`.
    pub async fn init_task(&self, task_id: Id) -> Result<(), RtmError> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::Creating {
            return Err(RtmError::AlreadyInitialized(task_id));
        }
        self.directory.clear_temp_dir(task_id)?;

        let app_client = self.get_app_client(&task.app_id, &task.environment, task_id).await?;
        app_client.create_task(task_id, task.max_subtasks, task.app_params.clone()).await?;
        Ok(())
    }

    /// Synchronous.
    pub fn start_task(&self, task_id: Id) -> Result<(), RtmError> {
        if !self.store.start_task(task_id)? {
            return Err(RtmError::AlreadyStarted(task_id));
        }
        Ok(())
    }

    pub fn task_exists(&self, task_id: Id) -> Result<bool, RtmError> {
        Ok(self.store.task_exists(task_id)?)
    }

    pub fn is_task_finished(&self, task_id: Id) -> Result<bool, RtmError> {
        Ok(self.store.get_task(task_id)?.status.is_completed())
    }

    pub fn get_task_network_resources_dir(&self, task_id: Id) -> Result<PathBuf, RtmError> {
        Ok(self.directory.network_resources_dir(task_id)?)
    }

    pub fn get_subtasks_outputs_dir(&self, task_id: Id) -> Result<PathBuf, RtmError> {
        Ok(self.directory.outputs_dir(task_id)?)
    }

    /// May suspend. The App Client is the source of truth; this is never
    /// cached.
    pub async fn has_pending_subtasks(&self, task_id: Id) -> Result<bool, RtmError> {
        let task = self.store.get_task(task_id)?;
        let app_client = self.get_app_client(&task.app_id, &task.environment, task_id).await?;
        Ok(app_client.has_pending_subtasks(task_id).await?)
    }

    /// Evaluates the admission rules in order, aborting with
    /// `AssignmentRefused` at the first violation.
    pub async fn get_next_subtask(&self, task_id: Id, computing_node: ComputingNode) -> Result<SubtaskDefinition, RtmError> {
        if !self.store.task_exists(task_id)? {
            return Err(RtmError::AssignmentRefused(task_id, AdmissionRule::TaskMustExist));
        }
        if computing_node.node_id == Id::from_public_key(&self.public_key) {
            return Err(RtmError::AssignmentRefused(task_id, AdmissionRule::NoSelfAssignment));
        }
        let task = self.store.get_task(task_id)?;
        if !task.status.is_active() {
            return Err(RtmError::AssignmentRefused(task_id, AdmissionRule::TaskMustBeActive));
        }

        if self.store.outstanding_subtask_exists(task_id, computing_node.node_id)? {
            return Err(RtmError::AssignmentRefused(task_id, AdmissionRule::NoOutstandingWork));
        }

        let app_client = self.get_app_client(&task.app_id, &task.environment, task_id).await?;
        if !app_client.has_pending_subtasks(task_id).await? {
            return Err(RtmError::AssignmentRefused(task_id, AdmissionRule::NoPendingSubtasks));
        }

        let descriptor = app_client.next_subtask(task_id).await?;
        let subtask = self
            .store
            .try_insert_subtask(
                task_id,
                descriptor.subtask_id.clone(),
                computing_node,
                descriptor.params,
                descriptor.resources,
                task.max_price_per_hour,
            )
            .map_err(|err| match err {
                rtm_store::StoreError::OutstandingSubtaskExists(_) => {
                    RtmError::AssignmentRefused(task_id, AdmissionRule::NoOutstandingWork)
                }
                other => RtmError::Storage(other),
            })?;

        self.timers.start(&subtask.subtask_id);
        let deadline = subtask.deadline(task.subtask_timeout_ms);
        Ok(SubtaskDefinition {
            subtask_id: subtask.subtask_id,
            resources: subtask.inputs,
            params: subtask.payload,
            deadline,
        })
    }

    /// May suspend around acquisition, around the App Client's `verify`
    /// call, and possibly around teardown.
    pub async fn verify(&self, task_id: Id, subtask_id: &SubtaskId) -> Result<bool, RtmError> {
        let task = self.store.get_task(task_id)?;
        if !task.status.is_active() {
            return Err(RtmError::TaskNotActive(task_id));
        }
        let subtask = self.store.get_subtask(task_id, subtask_id)?;
        if subtask.task_id != task_id {
            return Err(RtmError::SubtaskNotInTask(task_id, subtask_id.clone()));
        }

        self.store.set_subtask_status(task_id, subtask_id, rtm_lib::SubtaskStatus::Verifying)?;

        let app_client = self.get_app_client(&task.app_id, &task.environment, task_id).await?;
        let result = app_client.verify(task_id, subtask_id).await?;
        self.timers.finish(subtask_id);

        let task_completed = self.store.finish_subtask(task_id, subtask_id, result)?;
        if task_completed {
            info!(?task_id, "task reached max_subtasks finished subtasks");
            self.shutdown_app_client(&task.app_id).await?;
        }
        Ok(result)
    }

    /// May suspend around teardown.
    pub async fn abort_task(&self, task_id: Id) -> Result<(), RtmError> {
        let task = self.store.get_task(task_id)?;
        if !task.status.is_active() {
            return Err(RtmError::TaskNotActive(task_id));
        }
        self.store.set_task_status(task_id, TaskStatus::Aborted)?;
        let cancelled = self.store.cancel_active_subtasks(task_id)?;
        for subtask in &cancelled {
            self.timers.finish(&subtask.subtask_id);
        }
        self.shutdown_app_client(&task.app_id).await?;
        Ok(())
    }

    /// Single-flight per `appId`.
    async fn get_app_client(&self, app_id: &AppId, env_id: &EnvId, task_id: Id) -> Result<Arc<dyn AppClient>, RtmError> {
        let cell = self.app_clients.cell_for(app_id);
        let resources_dir = self.directory.network_resources_dir(task_id)?;
        let outputs_dir = self.directory.outputs_dir(task_id)?;
        let temp_dir = self.directory.temp_dir(task_id)?;
        let service_factory = &self.service_factory;
        let app_client_factory = &self.app_client_factory;

        let client = cell
            .get_or_try_init(|| async move {
                let service = service_factory.build(env_id, resources_dir, outputs_dir, temp_dir)?;
                debug!(?app_id, ?env_id, "constructing app client");
                app_client_factory.create(service).await.map_err(RtmError::from)
            })
            .await?;
        Ok(client.clone())
    }

    /// No-op unless `appId` has no active tasks left.
    async fn shutdown_app_client(&self, app_id: &AppId) -> Result<(), RtmError> {
        let active = self.store.count_active_tasks_for_app(app_id)?;
        if active > 0 {
            return Ok(());
        }
        if let Some(client) = self.app_clients.remove_initialized(app_id) {
            client.shutdown().await?;
            info!(?app_id, "app client torn down, no active tasks remain");
        }
        Ok(())
    }

    /// Initiates shutdown on every App Client concurrently and waits for
    /// all to settle. Not cleared proactively by any other operation; this
    /// is a terminal call.
    pub async fn quit(&self) -> Result<(), RtmError> {
        let clients = self.app_clients.all_initialized();
        if clients.is_empty() {
            return Ok(());
        }
        let mut set = JoinSet::new();
        for client in clients {
            set.spawn(async move { client.shutdown().await });
        }
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "app client shutdown failed during quit"),
                Err(join_err) => warn!(%join_err, "app client shutdown task panicked during quit"),
            }
        }
        self.app_clients.clear();
        Ok(())
    }
}
