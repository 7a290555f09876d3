//! Process wiring for the `rtm` binary: configuration, logging, and
//! construction of the Requested Task Manager from its collaborators.
//! RTM itself has no task-facing environment variables or CLI surface —
//! everything here is process-level configuration.

use std::fs::{create_dir_all, File};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rtm_appclient::{PartitioningAppClientFactory, VerifyPolicy};
use rtm_core::RequestedTaskManager;
use rtm_environment::{Environment, StaticEnvironmentManager};
use rtm_lib::{AppClientFactory, PrometheusComputeTimers};
use rtm_store::{InMemoryStore, SqliteStore, Store};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Parser)]
#[command(name = "rtm", about = "Requested Task Manager process host", long_about = None)]
pub struct Config {
    /// Root directory under which per-task resource/output/temp directories
    /// are created.
    #[arg(long, env = "RTM_ROOT_PATH", default_value = "rtm-data")]
    pub root_path: PathBuf,

    /// Path to a sqlite database file. When absent, RTM runs against an
    /// in-memory store that does not survive a restart.
    #[arg(long, env = "RTM_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Path to a JSON file of environment overrides, merged over the
    /// built-in defaults.
    #[arg(long, env = "RTM_ENVIRONMENTS_PATH")]
    pub environments_path: Option<PathBuf>,

    /// Directory to write rotating log files into, in addition to stdout.
    #[arg(long, env = "RTM_LOG_PATH")]
    pub log_path: Option<PathBuf>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

pub fn subscribe_log(log_path: &Option<PathBuf>, log_level: &str) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_ansi(true).with_filter(env_filter);

    let Some(dir) = log_path else {
        tracing_subscriber::registry().with(stdout_layer).init();
        return None;
    };

    if let Err(err) = create_dir_all(dir) {
        eprintln!("failed to create log dir {dir:?}: {err}");
        tracing_subscriber::registry().with(stdout_layer).init();
        return None;
    }

    let file_path = dir.join(format!("rtm-{}.log", chrono::Utc::now().format("%Y-%m-%d")));
    let file = match File::create(&file_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to create log file {file_path:?}: {err}");
            tracing_subscriber::registry().with(stdout_layer).init();
            return None;
        }
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let file_layer = fmt::layer().json().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry().with(stdout_layer).with(file_layer).init();
    Some(guard)
}

/// Builds the default registered environment set. In the reference process
/// this is a single demo environment with a no-op payload builder; real
/// deployments register one entry per supported execution environment.
fn default_environments() -> Vec<(Environment, Arc<dyn rtm_lib::PayloadBuilder>)> {
    struct EmptyPayload;
    impl rtm_lib::PayloadBuilder for EmptyPayload {
        fn build(&self, _env_id: &rtm_lib::EnvId) -> serde_json::Value {
            serde_json::json!({})
        }
    }

    vec![(
        Environment { env_id: "default".into(), description: "demo environment".into(), enabled: true },
        Arc::new(EmptyPayload) as Arc<dyn rtm_lib::PayloadBuilder>,
    )]
}

pub fn build_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match &config.store_path {
        Some(path) => {
            info!(?path, "opening sqlite store");
            Ok(Arc::new(SqliteStore::open(path)?))
        }
        None => {
            info!("no store_path configured, using an in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

pub fn build_environment_manager(config: &Config) -> anyhow::Result<Arc<StaticEnvironmentManager>> {
    let mut manager = StaticEnvironmentManager::new(default_environments());
    if let Some(path) = &config.environments_path {
        manager.merge_from_file(path)?;
    }
    Ok(Arc::new(manager))
}

pub fn build_rtm(
    config: &Config,
    public_key: Vec<u8>,
    environments: Arc<StaticEnvironmentManager>,
    store: Arc<dyn Store>,
) -> RequestedTaskManager {
    let app_client_factory: Arc<dyn AppClientFactory> = Arc::new(PartitioningAppClientFactory::new(VerifyPolicy::AlwaysSucceeds));
    RequestedTaskManager::new(
        public_key,
        config.root_path.clone(),
        environments,
        app_client_factory,
        store,
        Arc::new(PrometheusComputeTimers::new()),
    )
}
