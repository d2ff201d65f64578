//! Durability and recovery tests for the task registry.
//!
//! Tests cover:
//! - Write-through ordering between the registry and the store
//! - Crash/restart recovery of admitted tasks
//! - Store/registry agreement after recovery
//! - Terminal-state cleanup

use std::sync::Arc;

use caravel_core::config::PersistenceConfig;
use caravel_core::error::ErrorCode;
use caravel_core::protocol::TaskState;
use caravel_core::storage::{MemoryStorage, Storage};
use caravel_core::task::{ApplicationSpec, TaskRecord, TaskRegistry, TaskStore};

fn spec(name: &str) -> caravel_core::task::TaskSpec {
    ApplicationSpec {
        name: name.to_string(),
        cpus: 0.5,
        mem: 128.0,
        command: Some("echo hi".to_string()),
        ..Default::default()
    }
    .admit("root")
    .unwrap()
}

fn registry_on(storage: Arc<MemoryStorage>) -> TaskRegistry {
    TaskRegistry::new(TaskStore::new(storage, &PersistenceConfig::default()))
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn admitted_task_survives_restart_as_unknown() {
    let storage = Arc::new(MemoryStorage::new());
    let registry = registry_on(storage.clone());

    registry.add(spec("t1")).await.unwrap();
    drop(registry);

    // A fresh registry over the same store stands in for the restarted
    // replica.
    let restarted = registry_on(storage);
    restarted.recover().await.unwrap();

    assert_eq!(restarted.total_tasks(), 1);
    assert_eq!(restarted.state_of("t1"), Some(TaskState::Unknown));
}

// ============================================================================
// Store/registry agreement
// ============================================================================

#[tokio::test]
async fn recovery_agrees_with_store_contents() {
    let storage = Arc::new(MemoryStorage::new());
    let registry = registry_on(storage.clone());

    registry.add(spec("a")).await.unwrap();
    registry.add(spec("b")).await.unwrap();
    registry.add(spec("c")).await.unwrap();
    let b = registry.get_by_name("b").unwrap();
    registry.set(TaskState::Running, b).await.unwrap();

    let restarted = registry_on(storage.clone());
    restarted.recover().await.unwrap();

    // Every store key must be reflected in the registry with the same
    // (spec, state) pair.
    let entries = storage.read_all("/tasks/").await.unwrap();
    assert_eq!(entries.len(), restarted.total_tasks());
    for (_, value) in entries {
        let record = TaskRecord::decode(&value).unwrap();
        let live = restarted.get_by_name(&record.spec.name).unwrap();
        assert_eq!(live.task_id, record.spec.task_id);
        assert_eq!(restarted.state_of(&record.spec.name), Some(record.state));
    }
}

// ============================================================================
// Terminal cleanup
// ============================================================================

#[tokio::test]
async fn finished_task_is_gone_from_registry_and_store() {
    let storage = Arc::new(MemoryStorage::new());
    let registry = registry_on(storage.clone());

    let task = spec("t1");
    let id = task.task_id.clone();
    registry.add(task.clone()).await.unwrap();
    registry.set(TaskState::Finished, task).await.unwrap();

    assert_eq!(
        registry.get_by_name("t1").unwrap_err().code(),
        ErrorCode::TaskNotFound
    );
    assert!(storage
        .read(&format!("/tasks/{}", id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn killed_task_is_gone_from_registry_and_store() {
    let storage = Arc::new(MemoryStorage::new());
    let registry = registry_on(storage.clone());

    let task = spec("t1");
    let id = task.task_id.clone();
    registry.add(task.clone()).await.unwrap();
    registry.set(TaskState::Killed, task).await.unwrap();

    assert_eq!(
        registry.get_by_name("t1").unwrap_err().code(),
        ErrorCode::TaskNotFound
    );
    assert!(storage
        .read(&format!("/tasks/{}", id))
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Recovery of a pre-populated store
// ============================================================================

#[tokio::test]
async fn replica_recovers_prepopulated_records() {
    let storage = Arc::new(MemoryStorage::new());

    let running = spec("web");
    let queued = spec("batch");
    storage
        .create(
            &format!("/tasks/{}", running.task_id),
            &TaskRecord::new(running.clone(), TaskState::Running)
                .encode()
                .unwrap(),
        )
        .await
        .unwrap();
    storage
        .create(
            &format!("/tasks/{}", queued.task_id),
            &TaskRecord::new(queued.clone(), TaskState::Unknown)
                .encode()
                .unwrap(),
        )
        .await
        .unwrap();

    let registry = registry_on(storage);
    let recovered = registry.recover().await.unwrap();

    assert_eq!(recovered, 2);
    let names: Vec<String> = registry
        .tasks()
        .into_iter()
        .map(|record| record.spec.name)
        .collect();
    assert!(names.contains(&"web".to_string()));
    assert!(names.contains(&"batch".to_string()));
    assert_eq!(registry.state_of("web"), Some(TaskState::Running));
    assert_eq!(registry.state_of("batch"), Some(TaskState::Unknown));
}

// ============================================================================
// Task id uniqueness
// ============================================================================

#[tokio::test]
async fn task_ids_are_never_reused_across_redeploys() {
    let storage = Arc::new(MemoryStorage::new());
    let registry = registry_on(storage);

    let first = spec("t1");
    let first_id = first.task_id.clone();
    registry.add(first.clone()).await.unwrap();
    registry.delete(&first).await.unwrap();

    let second = spec("t1");
    registry.add(second.clone()).await.unwrap();
    assert_ne!(first_id, second.task_id);
}
