pub mod app_client;
pub mod id;
pub mod status;
pub mod timers;

pub use app_client::{AppClient, AppClientError, AppClientFactory, PayloadBuilder, SubtaskDescriptor, TaskApiService};
pub use id::{AppId, EnvId, Id, SubtaskId};
pub use status::{SubtaskStatus, TaskStatus};
pub use timers::{PrometheusComputeTimers, ProviderComputeTimers};
