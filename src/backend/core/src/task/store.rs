//! Persistent task store.
//!
//! Thin durability layer between the registry and the storage driver.
//! Tasks are written only on creation, update, and deletion; reads happen
//! only during recovery. Every mutation retries until the store accepts
//! it, sleeping the configured interval between attempts, with one seam:
//! in fail-fast mode the first failure returns instead, which is how the
//! failure-path tests get in.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::protocol::TaskId;
use crate::storage::Storage;

/// Key prefix for task records.
pub const TASK_PREFIX: &str = "/tasks/";

enum Mutation<'a> {
    Create(&'a str),
    Update(&'a str),
    Delete,
}

/// Durable mapping `task_id → encoded TaskRecord`.
pub struct TaskStore {
    storage: Arc<dyn Storage>,
    retry_interval: Duration,
    fail_fast: bool,
}

impl TaskStore {
    pub fn new(storage: Arc<dyn Storage>, cfg: &PersistenceConfig) -> Self {
        Self {
            storage,
            retry_interval: cfg.retry_interval,
            fail_fast: cfg.fail_fast,
        }
    }

    fn key(id: &TaskId) -> String {
        format!("{}{}", TASK_PREFIX, id)
    }

    pub async fn create(&self, id: &TaskId, value: &str) -> Result<()> {
        self.mutate(id, Mutation::Create(value)).await
    }

    pub async fn update(&self, id: &TaskId, value: &str) -> Result<()> {
        self.mutate(id, Mutation::Update(value)).await
    }

    pub async fn delete(&self, id: &TaskId) -> Result<()> {
        self.mutate(id, Mutation::Delete).await
    }

    /// Every persisted record, for startup recovery.
    pub async fn load_all(&self) -> Result<Vec<(String, String)>> {
        self.storage.read_all(TASK_PREFIX).await
    }

    async fn mutate(&self, id: &TaskId, mutation: Mutation<'_>) -> Result<()> {
        let key = Self::key(id);
        loop {
            let result = match &mutation {
                Mutation::Create(value) => self.storage.create(&key, value).await,
                Mutation::Update(value) => self.storage.update(&key, value).await,
                Mutation::Delete => self.storage.delete(&key).await,
            };

            match result {
                Ok(()) => return Ok(()),
                // Non-transient outcomes (duplicate key, missing key) are
                // the caller's problem; looping would never converge.
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    error!(task_id = %id, error = %e, "Store write failed; retrying");
                    metrics::counter!("caravel_store_retries_total").increment(1);
                    if self.fail_fast {
                        warn!(task_id = %id, "Fail-fast store surfacing write error");
                        return Err(e);
                    }
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CaravelError, ErrorCode};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Storage double that fails a configured number of writes before
    /// delegating to a real in-memory backend.
    struct FlakyStorage {
        inner: MemoryStorage,
        failures_left: AtomicU32,
    }

    impl FlakyStorage {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStorage::new(),
                failures_left: AtomicU32::new(failures),
            }
        }

        fn maybe_fail(&self) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CaravelError::with_internal(
                    ErrorCode::StorageConnectionFailed,
                    "Storage backend failure",
                    "injected",
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn create(&self, key: &str, value: &str) -> Result<()> {
            self.maybe_fail()?;
            self.inner.create(key, value).await
        }
        async fn create_if_absent(&self, key: &str, value: &str) -> Result<bool> {
            self.maybe_fail()?;
            self.inner.create_if_absent(key, value).await
        }
        async fn update(&self, key: &str, value: &str) -> Result<()> {
            self.maybe_fail()?;
            self.inner.update(key, value).await
        }
        async fn read(&self, key: &str) -> Result<Option<String>> {
            self.inner.read(key).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.maybe_fail()?;
            self.inner.delete(key).await
        }
        async fn read_all(&self, prefix: &str) -> Result<Vec<(String, String)>> {
            self.inner.read_all(prefix).await
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn cfg(fail_fast: bool) -> PersistenceConfig {
        PersistenceConfig {
            retry_interval: Duration::from_millis(5),
            fail_fast,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_retries_until_the_store_accepts() {
        let storage = Arc::new(FlakyStorage::new(2));
        let store = TaskStore::new(storage.clone(), &cfg(false));

        store.create(&"t-1".to_string(), "v").await.unwrap();
        assert_eq!(
            storage.read("/tasks/t-1").await.unwrap().as_deref(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn fail_fast_surfaces_the_first_failure() {
        let storage = Arc::new(FlakyStorage::new(1));
        let store = TaskStore::new(storage, &cfg(true));

        let err = store.create(&"t-1".to_string(), "v").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn duplicate_create_is_not_retried() {
        let storage = Arc::new(MemoryStorage::new());
        let store = TaskStore::new(storage, &cfg(false));

        store.create(&"t-1".to_string(), "v").await.unwrap();
        let err = store.create(&"t-1".to_string(), "v2").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
    }

    #[tokio::test]
    async fn load_all_returns_only_task_keys() {
        let storage = Arc::new(MemoryStorage::new());
        storage.create("/leader", "addr").await.unwrap();
        let store = TaskStore::new(storage, &cfg(false));

        store.create(&"t-1".to_string(), "v").await.unwrap();
        let entries = store.load_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "/tasks/t-1");
    }
}
