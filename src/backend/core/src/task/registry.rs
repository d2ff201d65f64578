//! Authoritative in-memory task catalog with write-through persistence.
//!
//! The registry owns the `name → (spec, state)` view the rest of the
//! scheduler works against. Mutations are written through: the store
//! write must succeed before the in-memory view changes, except terminal
//! deletions, which remove the store key first and the catalog entry
//! second. A per-name async lock serializes writers so no two handlers
//! mutate the same task concurrently.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{TaskRecord, TaskSpec, TaskStore};
use crate::error::{CaravelError, ErrorCode, Result};
use crate::protocol::{TaskId, TaskState};

/// Concurrent catalog of admitted tasks, keyed by name.
pub struct TaskRegistry {
    tasks: DashMap<String, TaskRecord>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    store: TaskStore,
}

impl TaskRegistry {
    pub fn new(store: TaskStore) -> Self {
        Self {
            tasks: DashMap::new(),
            locks: DashMap::new(),
            store,
        }
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Admit a task: persist `(spec, UNKNOWN)` and insert it into the
    /// catalog. The store write happens before the duplicate check, so a
    /// name collision leaves the freshly written record orphaned in the
    /// store; recovery keys by task id and tolerates it.
    pub async fn add(&self, spec: TaskSpec) -> Result<()> {
        let lock = self.name_lock(&spec.name);
        let _guard = lock.lock().await;

        let record = TaskRecord::new(spec, TaskState::Unknown);
        let encoded = record.encode()?;
        self.store.create(&record.spec.task_id, &encoded).await?;

        if self.tasks.contains_key(&record.spec.name) {
            return Err(CaravelError::already_exists(&record.spec.name));
        }

        info!(name = %record.spec.name, task_id = %record.spec.task_id, "Task admitted");
        self.tasks.insert(record.spec.name.clone(), record);
        Ok(())
    }

    /// Remove a task: store key first (retrying), catalog entry second.
    /// Deleting an unknown task is a no-op.
    pub async fn delete(&self, spec: &TaskSpec) -> Result<()> {
        let lock = self.name_lock(&spec.name);
        let _guard = lock.lock().await;

        self.store.delete(&spec.task_id).await?;
        self.tasks.remove(&spec.name);
        debug!(name = %spec.name, task_id = %spec.task_id, "Task deleted");
        drop(_guard);
        // Late lockers find a fresh lock and act idempotently on the
        // now-absent entry.
        self.locks.remove(&spec.name);
        Ok(())
    }

    /// Record a state transition: persist `(spec, state)` and update the
    /// catalog. Terminal states (`FINISHED`, `KILLED`) delete the task.
    pub async fn set(&self, state: TaskState, spec: TaskSpec) -> Result<()> {
        {
            let lock = self.name_lock(&spec.name);
            let _guard = lock.lock().await;

            let record = TaskRecord::new(spec.clone(), state);
            let encoded = record.encode()?;
            self.store.update(&record.spec.task_id, &encoded).await?;
            self.tasks.insert(record.spec.name.clone(), record);
        }

        if state.is_terminal() {
            self.delete(&spec).await?;
        }
        Ok(())
    }

    pub fn get_by_name(&self, name: &str) -> Result<TaskSpec> {
        self.tasks
            .get(name)
            .map(|entry| entry.spec.clone())
            .ok_or_else(|| CaravelError::not_found(name))
    }

    /// Linear scan of the snapshot; task ids are not indexed.
    pub fn get_by_id(&self, task_id: &TaskId) -> Result<TaskSpec> {
        if self.tasks.is_empty() {
            return Err(CaravelError::new(
                ErrorCode::RegistryEmpty,
                "Task registry is empty",
            ));
        }
        self.tasks
            .iter()
            .find(|entry| &entry.spec.task_id == task_id)
            .map(|entry| entry.spec.clone())
            .ok_or_else(|| {
                CaravelError::new(
                    ErrorCode::TaskNotFound,
                    format!("No task with id {}", task_id),
                )
            })
    }

    pub fn has_task(&self, spec: &TaskSpec) -> bool {
        self.tasks.contains_key(&spec.name)
    }

    /// All tasks currently in the given state, in catalog iteration order.
    pub fn get_state(&self, state: TaskState) -> Result<Vec<TaskSpec>> {
        let matched: Vec<TaskSpec> = self
            .tasks
            .iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.spec.clone())
            .collect();

        if matched.is_empty() {
            return Err(CaravelError::new(
                ErrorCode::NoTasksInState,
                format!("No tasks found with state {}", state),
            ));
        }
        Ok(matched)
    }

    /// Point-in-time snapshot of the catalog, safe to take under
    /// concurrent insertion and deletion.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        self.tasks.get(name).map(|entry| entry.state)
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Rebuild the catalog from the store. Called once, before the event
    /// loop starts; persisted states are taken as-is.
    pub async fn recover(&self) -> Result<usize> {
        let entries = self.store.load_all().await?;
        let mut recovered = 0;
        for (key, value) in entries {
            match TaskRecord::decode(&value) {
                Ok(record) => {
                    self.tasks.insert(record.spec.name.clone(), record);
                    recovered += 1;
                }
                Err(e) => {
                    // A record we cannot read is a record we cannot run.
                    error!(key = %key, error = %e, "Skipping undecodable task record");
                }
            }
        }
        info!(recovered, "Task registry recovered from store");
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::storage::{MemoryStorage, Storage};
    use crate::task::ApplicationSpec;

    fn registry_with_store() -> (Arc<MemoryStorage>, TaskRegistry) {
        let storage = Arc::new(MemoryStorage::new());
        let store = TaskStore::new(storage.clone(), &PersistenceConfig::default());
        (storage, TaskRegistry::new(store))
    }

    fn spec(name: &str) -> TaskSpec {
        ApplicationSpec {
            name: name.to_string(),
            cpus: 0.5,
            mem: 64.0,
            command: Some("true".to_string()),
            ..Default::default()
        }
        .admit("root")
        .unwrap()
    }

    #[tokio::test]
    async fn add_persists_before_inserting() {
        let (storage, registry) = registry_with_store();
        let task = spec("t1");
        let id = task.task_id.clone();

        registry.add(task).await.unwrap();

        let stored = storage.read(&format!("/tasks/{}", id)).await.unwrap();
        let record = TaskRecord::decode(&stored.unwrap()).unwrap();
        assert_eq!(record.state, TaskState::Unknown);
        assert_eq!(registry.get_by_name("t1").unwrap().task_id, id);
    }

    #[tokio::test]
    async fn duplicate_add_errors_and_leaves_orphan_record() {
        let (storage, registry) = registry_with_store();
        registry.add(spec("t1")).await.unwrap();

        let second = spec("t1");
        let orphan_id = second.task_id.clone();
        let err = registry.add(second).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TaskAlreadyExists);

        // The losing record was persisted before the collision check.
        let orphan = storage
            .read(&format!("/tasks/{}", orphan_id))
            .await
            .unwrap();
        assert!(orphan.is_some());
    }

    #[tokio::test]
    async fn terminal_set_deletes_store_key_and_entry() {
        let (storage, registry) = registry_with_store();
        let task = spec("t1");
        let id = task.task_id.clone();
        registry.add(task.clone()).await.unwrap();

        registry.set(TaskState::Finished, task).await.unwrap();

        assert!(storage
            .read(&format!("/tasks/{}", id))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            registry.get_by_name("t1").unwrap_err().code(),
            ErrorCode::TaskNotFound
        );
    }

    #[tokio::test]
    async fn set_updates_state_in_place_for_non_terminal() {
        let (_, registry) = registry_with_store();
        let task = spec("t1");
        registry.add(task.clone()).await.unwrap();

        registry.set(TaskState::Running, task.clone()).await.unwrap();
        assert_eq!(registry.state_of("t1"), Some(TaskState::Running));
        assert_eq!(registry.total_tasks(), 1);
        assert!(registry.has_task(&task));
    }

    #[tokio::test]
    async fn get_by_id_distinguishes_empty_from_missing() {
        let (_, registry) = registry_with_store();
        assert_eq!(
            registry.get_by_id(&"nope".to_string()).unwrap_err().code(),
            ErrorCode::RegistryEmpty
        );

        registry.add(spec("t1")).await.unwrap();
        assert_eq!(
            registry.get_by_id(&"nope".to_string()).unwrap_err().code(),
            ErrorCode::TaskNotFound
        );
    }

    #[tokio::test]
    async fn get_state_filters_and_errors_when_empty() {
        let (_, registry) = registry_with_store();
        let a = spec("a");
        let b = spec("b");
        registry.add(a.clone()).await.unwrap();
        registry.add(b).await.unwrap();
        registry.set(TaskState::Running, a).await.unwrap();

        let unknown = registry.get_state(TaskState::Unknown).unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].name, "b");

        assert_eq!(
            registry.get_state(TaskState::Failed).unwrap_err().code(),
            ErrorCode::NoTasksInState
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_, registry) = registry_with_store();
        let task = spec("t1");
        registry.add(task.clone()).await.unwrap();
        registry.delete(&task).await.unwrap();
        registry.delete(&task).await.unwrap();
        assert_eq!(registry.total_tasks(), 0);
    }

    #[tokio::test]
    async fn recover_rebuilds_catalog_from_store() {
        let storage = Arc::new(MemoryStorage::new());
        let a = spec("a");
        let b = spec("b");
        storage
            .create(
                &format!("/tasks/{}", a.task_id),
                &TaskRecord::new(a.clone(), TaskState::Running).encode().unwrap(),
            )
            .await
            .unwrap();
        storage
            .create(
                &format!("/tasks/{}", b.task_id),
                &TaskRecord::new(b, TaskState::Unknown).encode().unwrap(),
            )
            .await
            .unwrap();

        let registry =
            TaskRegistry::new(TaskStore::new(storage, &PersistenceConfig::default()));
        let recovered = registry.recover().await.unwrap();

        assert_eq!(recovered, 2);
        assert_eq!(registry.state_of("a"), Some(TaskState::Running));
        assert_eq!(registry.state_of("b"), Some(TaskState::Unknown));
    }
}
