//! Directory Manager: pure path resolution for a task's network-resources
//! directory, outputs directory, and a clearable temporary directory. RTM
//! asks it for paths by task identifier; it never inspects file contents.

use std::fs;
use std::io;
use std::path::PathBuf;

use rtm_lib::Id;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to create directory {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to clear directory {path}: {source}")]
    Clear { path: PathBuf, source: io::Error },
}

/// Resolves the three task-scoped directories RTM needs and nothing else.
/// All paths are rooted under a single configured directory, namespaced by
/// `taskId`, and created on demand.
pub struct DirectoryManager {
    root: PathBuf,
}

impl DirectoryManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn network_resources_dir(&self, task_id: Id) -> Result<PathBuf, DirectoryError> {
        self.task_subdir(task_id, "resources")
    }

    pub fn outputs_dir(&self, task_id: Id) -> Result<PathBuf, DirectoryError> {
        self.task_subdir(task_id, "outputs")
    }

    pub fn temp_dir(&self, task_id: Id) -> Result<PathBuf, DirectoryError> {
        self.task_subdir(task_id, "tmp")
    }

    /// Removes and recreates the task's temporary directory, called before
    /// the App Client is invoked.
    pub fn clear_temp_dir(&self, task_id: Id) -> Result<PathBuf, DirectoryError> {
        let dir = self.task_dir(task_id).join("tmp");
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|source| DirectoryError::Clear { path: dir.clone(), source })?;
            debug!(?task_id, path = ?dir, "cleared temp dir");
        }
        fs::create_dir_all(&dir).map_err(|source| DirectoryError::Create { path: dir.clone(), source })?;
        Ok(dir)
    }

    fn task_dir(&self, task_id: Id) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn task_subdir(&self, task_id: Id, name: &str) -> Result<PathBuf, DirectoryError> {
        let dir = self.task_dir(task_id).join(name);
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|source| DirectoryError::Create { path: dir.clone(), source })?;
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_task_directories_are_distinct_and_created() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = DirectoryManager::new(tmp.path());
        let task_id = Id::from_public_key(b"task-a");

        let resources = manager.network_resources_dir(task_id).unwrap();
        let outputs = manager.outputs_dir(task_id).unwrap();
        let temp = manager.temp_dir(task_id).unwrap();

        assert!(resources.exists());
        assert!(outputs.exists());
        assert!(temp.exists());
        assert_ne!(resources, outputs);
        assert_ne!(outputs, temp);
    }

    #[test]
    fn clear_temp_dir_removes_stale_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = DirectoryManager::new(tmp.path());
        let task_id = Id::from_public_key(b"task-a");

        let temp = manager.temp_dir(task_id).unwrap();
        fs::write(temp.join("stale.txt"), b"leftover").unwrap();
        assert!(temp.join("stale.txt").exists());

        let cleared = manager.clear_temp_dir(task_id).unwrap();
        assert_eq!(cleared, temp);
        assert!(!temp.join("stale.txt").exists());
    }

    #[test]
    fn different_tasks_get_different_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = DirectoryManager::new(tmp.path());
        let a = manager.outputs_dir(Id::from_public_key(b"task-a")).unwrap();
        let b = manager.outputs_dir(Id::from_public_key(b"task-b")).unwrap();
        assert_ne!(a, b);
    }
}
