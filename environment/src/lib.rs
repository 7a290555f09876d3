//! Environment Manager and Task API Service Factory. RTM only ever asks
//! "is this environment enabled?" and "build me a service for it" — the
//! registry itself, and how prerequisites are built per environment, are
//! collaborators it treats as opaque.
//!
//! The registry is a name-keyed map built from a bundled default set and
//! mergeable with an operator-supplied override file.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rtm_lib::{EnvId, PayloadBuilder, TaskApiService};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("environment {0} is disabled")]
    Disabled(EnvId),

    #[error("failed to read environment overrides from {path}: {source}")]
    OverrideFile { path: PathBuf, source: std::io::Error },

    #[error("malformed environment overrides: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Metadata for one registered execution environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub env_id: EnvId,
    pub description: String,
    pub enabled: bool,
}

/// What RTM needs from the Environment Manager.
pub trait EnvironmentManager: Send + Sync {
    fn enabled(&self, env_id: &EnvId) -> bool;
    fn environment(&self, env_id: &EnvId) -> Option<Environment>;
    fn payload_builder(&self, env_id: &EnvId) -> Option<Arc<dyn PayloadBuilder>>;
}

/// A registry built once at process start and optionally overridden from a
/// config file, mirroring `SupportedChainSpecs::default()` /
/// `merge_from_file`. Payload builders are supplied in Rust, not config,
/// since they are code, not data.
pub struct StaticEnvironmentManager {
    entries: HashMap<EnvId, (Environment, Arc<dyn PayloadBuilder>)>,
}

impl StaticEnvironmentManager {
    pub fn new(entries: Vec<(Environment, Arc<dyn PayloadBuilder>)>) -> Self {
        Self {
            entries: entries.into_iter().map(|(env, builder)| (env.env_id.clone(), (env, builder))).collect(),
        }
    }

    /// Overrides `enabled`/`description` for environments named in `path`,
    /// leaving their payload builders untouched. Unknown environment ids in
    /// the override file are ignored — they have no builder to pair with.
    pub fn merge_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), EnvironmentError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| EnvironmentError::OverrideFile { path: path.to_path_buf(), source })?;
        let overrides: Vec<Environment> = serde_json::from_reader(BufReader::new(file))?;
        for over in overrides {
            if let Some((env, _)) = self.entries.get_mut(&over.env_id) {
                env.description = over.description;
                env.enabled = over.enabled;
            }
        }
        Ok(())
    }
}

impl EnvironmentManager for StaticEnvironmentManager {
    fn enabled(&self, env_id: &EnvId) -> bool {
        self.entries.get(env_id).map(|(env, _)| env.enabled).unwrap_or(false)
    }

    fn environment(&self, env_id: &EnvId) -> Option<Environment> {
        self.entries.get(env_id).map(|(env, _)| env.clone())
    }

    fn payload_builder(&self, env_id: &EnvId) -> Option<Arc<dyn PayloadBuilder>> {
        self.entries.get(env_id).map(|(_, builder)| builder.clone())
    }
}

/// Binds an environment's payload builder output with caller-resolved
/// directories into a `TaskApiService`.
pub struct TaskApiServiceFactory {
    environments: Arc<dyn EnvironmentManager>,
}

impl TaskApiServiceFactory {
    pub fn new(environments: Arc<dyn EnvironmentManager>) -> Self {
        Self { environments }
    }

    pub fn build(
        &self,
        env_id: &EnvId,
        resources_dir: PathBuf,
        outputs_dir: PathBuf,
        temp_dir: PathBuf,
    ) -> Result<TaskApiService, EnvironmentError> {
        if !self.environments.enabled(env_id) {
            return Err(EnvironmentError::Disabled(env_id.clone()));
        }
        let builder = self
            .environments
            .payload_builder(env_id)
            .ok_or_else(|| EnvironmentError::Disabled(env_id.clone()))?;
        Ok(TaskApiService {
            env_id: env_id.clone(),
            prerequisites: builder.build(env_id),
            resources_dir,
            outputs_dir,
            temp_dir,
        })
    }
}
