use std::path::PathBuf;

use clap::Parser;
use rtm::{build_environment_manager, build_rtm, build_store, subscribe_log, Config};
use rtm_store::CreateTaskParams;
use serde_json::json;
use tracing::{debug, info};

/// Demo entry point: wires up an in-process RTM against the configured
/// store and drives one task through its full lifecycle.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();
    let _guard = subscribe_log(&config.log_path, &config.log_level);
    debug!(?config, "starting rtm");

    let public_key = b"demo-requestor-key".to_vec();
    let store = build_store(&config)?;
    let environments = build_environment_manager(&config)?;
    let rtm = build_rtm(&config, public_key, environments, store);

    let params = CreateTaskParams {
        app_id: "demo-app".into(),
        name: "demo task".into(),
        environment: "default".into(),
        task_timeout_ms: 60_000,
        subtask_timeout_ms: 5_000,
        output_directory: PathBuf::from("demo-output"),
        resources: vec![],
        max_subtasks: 1,
        max_price_per_hour: 1.0,
        consent_enabled: false,
    };
    let task_id = rtm.create_task(params, json!({}))?;
    info!(?task_id, "created task");

    rtm.init_task(task_id).await?;
    rtm.start_task(task_id)?;
    info!(?task_id, "task started");

    let node = rtm_store::ComputingNode {
        node_id: rtm_lib::Id::from_public_key(b"demo-provider-key"),
        name: "demo-provider".into(),
    };
    let subtask = rtm.get_next_subtask(task_id, node).await?;
    info!(subtask_id = %subtask.subtask_id, "assigned subtask");

    let verified = rtm.verify(task_id, &subtask.subtask_id).await?;
    info!(verified, "verification complete");

    if rtm.is_task_finished(task_id)? {
        info!(?task_id, "task finished");
    }

    rtm.quit().await?;
    Ok(())
}
