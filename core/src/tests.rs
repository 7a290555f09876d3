use std::path::PathBuf;
use std::sync::Arc;

use rtm_appclient::{PartitioningAppClientFactory, VerifyPolicy};
use rtm_environment::{Environment, StaticEnvironmentManager};
use rtm_lib::{EnvId, Id, PayloadBuilder, PrometheusComputeTimers};
use rtm_store::{ComputingNode, CreateTaskParams, InMemoryStore};
use serde_json::{json, Value};

use crate::error::{AdmissionRule, RtmError};
use crate::rtm::RequestedTaskManager;

struct EmptyPayload;
impl PayloadBuilder for EmptyPayload {
    fn build(&self, _env_id: &EnvId) -> Value {
        json!({})
    }
}

fn environments(enabled: bool) -> Arc<StaticEnvironmentManager> {
    Arc::new(StaticEnvironmentManager::new(vec![(
        Environment { env_id: "a".into(), description: "test env".into(), enabled },
        Arc::new(EmptyPayload),
    )]))
}

fn params(max_subtasks: u32) -> CreateTaskParams {
    CreateTaskParams {
        app_id: "a".into(),
        name: "job".into(),
        environment: "a".into(),
        task_timeout_ms: 10_000,
        subtask_timeout_ms: 1,
        output_directory: PathBuf::from("out"),
        resources: vec![],
        max_subtasks,
        max_price_per_hour: 1.0,
        consent_enabled: false,
    }
}

fn rtm(verify_policy: VerifyPolicy) -> (RequestedTaskManager, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let rtm = RequestedTaskManager::new(
        b"requestor-key".to_vec(),
        root.path(),
        environments(true),
        Arc::new(PartitioningAppClientFactory::new(verify_policy)),
        Arc::new(InMemoryStore::new()),
        Arc::new(PrometheusComputeTimers::new()),
    );
    (rtm, root)
}

fn node(name: &str) -> ComputingNode {
    ComputingNode { node_id: Id::from_public_key(name.as_bytes()), name: name.to_string() }
}

/// Scenario 1: create + init.
#[tokio::test]
async fn create_then_init_leaves_task_creating() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    assert!(rtm.task_exists(task_id).unwrap());

    rtm.init_task(task_id).await.unwrap();
    assert!(!rtm.is_task_finished(task_id).unwrap());
}

/// Scenario 2: start.
#[tokio::test]
async fn start_task_transitions_to_active() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();
    assert!(!rtm.is_task_finished(task_id).unwrap());
}

/// Scenario 3: next subtask.
#[tokio::test]
async fn get_next_subtask_inserts_subtask_row() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();

    let subtask = rtm.get_next_subtask(task_id, node("provider-1")).await.unwrap();
    assert_eq!(subtask.subtask_id, "subtask-0");
    assert!(subtask.resources.is_empty());
}

/// Scenario 4: verify success completes the task.
#[tokio::test]
async fn verify_success_completes_task_when_max_subtasks_reached() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();
    let subtask = rtm.get_next_subtask(task_id, node("provider-1")).await.unwrap();

    let result = rtm.verify(task_id, &subtask.subtask_id).await.unwrap();
    assert!(result);
    assert!(rtm.is_task_finished(task_id).unwrap());
}

/// Scenario 5: verify failure leaves the task active.
#[tokio::test]
async fn verify_failure_leaves_task_active() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysFails);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();
    let subtask = rtm.get_next_subtask(task_id, node("provider-1")).await.unwrap();

    let result = rtm.verify(task_id, &subtask.subtask_id).await.unwrap();
    assert!(!result);
    assert!(!rtm.is_task_finished(task_id).unwrap());
}

/// Scenario 6: abort after assignment.
#[tokio::test]
async fn abort_after_assignment_cancels_outstanding_subtask() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(2), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();
    rtm.get_next_subtask(task_id, node("provider-1")).await.unwrap();

    rtm.abort_task(task_id).await.unwrap();
    assert!(rtm.is_task_finished(task_id).unwrap());
}

#[tokio::test]
async fn double_start_task_fails_with_already_started() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    rtm.start_task(task_id).unwrap();
    let err = rtm.start_task(task_id).unwrap_err();
    assert!(matches!(err, RtmError::AlreadyStarted(_)));
}

#[tokio::test]
async fn double_init_task_fails_with_already_initialized() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();
    let err = rtm.init_task(task_id).await.unwrap_err();
    assert!(matches!(err, RtmError::AlreadyInitialized(_)));
}

#[tokio::test]
async fn task_exists_is_false_for_unknown_id() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    assert!(!rtm.task_exists(Id::from_public_key(b"unknown")).unwrap());
}

#[tokio::test]
async fn second_get_next_subtask_for_same_pair_is_refused_until_resolved() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(2), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();
    let provider = node("provider-1");

    rtm.get_next_subtask(task_id, provider.clone()).await.unwrap();
    let err = rtm.get_next_subtask(task_id, provider).await.unwrap_err();
    assert!(matches!(err, RtmError::AssignmentRefused(_, AdmissionRule::NoOutstandingWork)));
}

/// A provider that already holds an outstanding subtask must be refused
/// before the App Client is given a chance to issue another one — the
/// refusal must not cost the task a unit of work it can never reclaim.
#[tokio::test]
async fn repeated_assignment_for_same_provider_does_not_consume_app_client_work() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(2), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();
    let provider = node("provider-1");

    let first = rtm.get_next_subtask(task_id, provider.clone()).await.unwrap();
    assert_eq!(first.subtask_id, "subtask-0");

    let err = rtm.get_next_subtask(task_id, provider).await.unwrap_err();
    assert!(matches!(err, RtmError::AssignmentRefused(_, AdmissionRule::NoOutstandingWork)));

    // A different provider must still be able to draw `subtask-1` — had the
    // refused call above reached `next_subtask`, the App Client would have
    // already issued it and this would come back empty.
    let second = rtm.get_next_subtask(task_id, node("provider-2")).await.unwrap();
    assert_eq!(second.subtask_id, "subtask-1");
}

#[tokio::test]
async fn self_assignment_is_refused() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();

    let self_node = ComputingNode { node_id: Id::from_public_key(b"requestor-key"), name: "self".into() };
    let err = rtm.get_next_subtask(task_id, self_node).await.unwrap_err();
    assert!(matches!(err, RtmError::AssignmentRefused(_, AdmissionRule::NoSelfAssignment)));
}

#[tokio::test]
async fn get_next_subtask_on_unknown_task_is_refused() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    let err = rtm.get_next_subtask(Id::from_public_key(b"unknown"), node("p1")).await.unwrap_err();
    assert!(matches!(err, RtmError::AssignmentRefused(_, AdmissionRule::TaskMustExist)));
}

#[tokio::test]
async fn disabled_environment_refuses_init() {
    let root = tempfile::tempdir().unwrap();
    let rtm = RequestedTaskManager::new(
        b"requestor-key".to_vec(),
        root.path(),
        environments(false),
        Arc::new(PartitioningAppClientFactory::new(VerifyPolicy::AlwaysSucceeds)),
        Arc::new(InMemoryStore::new()),
        Arc::new(PrometheusComputeTimers::new()),
    );
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    let err = rtm.init_task(task_id).await.unwrap_err();
    assert!(matches!(err, RtmError::EnvironmentDisabled(_)));
}

#[tokio::test]
async fn quit_completes_immediately_with_no_app_clients() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysSucceeds);
    rtm.quit().await.unwrap();
}

#[tokio::test]
async fn quit_shuts_down_app_clients_created_during_use() {
    let (rtm, _root) = rtm(VerifyPolicy::AlwaysFails);
    let task_id = rtm.create_task(params(1), json!({})).unwrap();
    rtm.init_task(task_id).await.unwrap();
    rtm.start_task(task_id).unwrap();
    rtm.get_next_subtask(task_id, node("provider-1")).await.unwrap();

    rtm.quit().await.unwrap();
}
