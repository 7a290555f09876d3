//! The `appClients: appId → AppClient` map. Creation must be single-flight
//! per `appId`; deletion must be mutually exclusive with creation for the
//! same key. Uses `dashmap::DashMap` for sharded concurrent state, paired
//! with `tokio::sync::OnceCell` for the async, exactly-once construction
//! `DashMap` alone doesn't give you.

use std::sync::Arc;

use dashmap::DashMap;
use rtm_lib::{AppClient, AppId};
use tokio::sync::OnceCell;

type Cell = Arc<OnceCell<Arc<dyn AppClient>>>;

#[derive(Default)]
pub struct AppClientMap {
    entries: DashMap<AppId, Cell>,
}

impl AppClientMap {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Returns the cell for `app_id`, creating an empty one if absent. The
    /// caller drives the async initialisation itself via the returned
    /// cell's `get_or_try_init`, outside of any `DashMap` shard lock.
    pub fn cell_for(&self, app_id: &AppId) -> Cell {
        self.entries.entry(app_id.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
    }

    /// Removes `app_id`'s entry if it is present and already initialised,
    /// returning the client so the caller can shut it down. Returns `None`
    /// if there is no entry, or if one exists but is still being
    /// constructed by a concurrent `cell_for`/`get_or_try_init` caller — in
    /// that case the entry is left in place so the in-flight construction
    /// still lands in the map instead of being orphaned from it.
    pub fn remove_initialized(&self, app_id: &AppId) -> Option<Arc<dyn AppClient>> {
        let (_, cell) = self.entries.remove_if(app_id, |_, cell| cell.get().is_some())?;
        cell.get().cloned()
    }

    /// All currently-initialised clients. Used by `quit`.
    pub fn all_initialized(&self) -> Vec<Arc<dyn AppClient>> {
        self.entries.iter().filter_map(|entry| entry.value().get().cloned()).collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtm_lib::{AppClientError, Id, SubtaskDescriptor, SubtaskId};
    use serde_json::Value;

    struct NullAppClient;

    #[async_trait::async_trait]
    impl AppClient for NullAppClient {
        async fn create_task(&self, _: Id, _: u32, _: Value) -> Result<(), AppClientError> {
            Ok(())
        }
        async fn has_pending_subtasks(&self, _: Id) -> Result<bool, AppClientError> {
            Ok(false)
        }
        async fn next_subtask(&self, _: Id) -> Result<SubtaskDescriptor, AppClientError> {
            unimplemented!()
        }
        async fn verify(&self, _: Id, _: &SubtaskId) -> Result<bool, AppClientError> {
            Ok(true)
        }
        async fn shutdown(&self) -> Result<(), AppClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cell_for_same_app_id_is_shared() {
        let map = AppClientMap::new();
        let app_id: AppId = "a".into();
        let cell_a = map.cell_for(&app_id);
        let cell_b = map.cell_for(&app_id);
        cell_a
            .get_or_try_init(|| async { Ok::<_, AppClientError>(Arc::new(NullAppClient) as Arc<dyn AppClient>) })
            .await
            .unwrap();
        assert!(cell_b.get().is_some());
    }

    #[tokio::test]
    async fn remove_initialized_returns_client_and_clears_entry() {
        let map = AppClientMap::new();
        let app_id: AppId = "a".into();
        let cell = map.cell_for(&app_id);
        cell.get_or_try_init(|| async { Ok::<_, AppClientError>(Arc::new(NullAppClient) as Arc<dyn AppClient>) })
            .await
            .unwrap();
        assert!(map.remove_initialized(&app_id).is_some());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn remove_initialized_leaves_an_in_flight_cell_in_place() {
        let map = AppClientMap::new();
        let app_id: AppId = "a".into();
        let _cell = map.cell_for(&app_id);

        assert!(map.remove_initialized(&app_id).is_none());
        assert!(!map.is_empty());
    }
}
