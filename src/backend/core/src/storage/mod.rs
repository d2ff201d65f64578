//! Key/value persistence backends.
//!
//! Two backends implement the [`Storage`] trait:
//! - **MemoryStorage**: process-local map for tests and development
//! - **RedisStorage**: shared store for production replica sets
//!
//! `create_if_absent` is the atomic claim primitive leader election
//! depends on; both backends implement it with compare-free semantics
//! (SET NX on redis, entry-level insertion on the map).

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::PersistenceConfig;
use crate::error::{CaravelError, ErrorCode, Result};

/// Trait for key/value store drivers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write a new key. Fails with `DuplicateKey` if the key exists.
    async fn create(&self, key: &str, value: &str) -> Result<()>;

    /// Write the key only if absent. Returns whether the write happened.
    async fn create_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Overwrite an existing key. Fails with `KeyNotFound` if absent.
    async fn update(&self, key: &str, value: &str) -> Result<()>;

    /// Read one key.
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Delete one key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Read every key under a prefix. Used only during recovery.
    async fn read_all(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Build the configured storage backend. Endpoints starting with
/// `redis://` select the redis driver; the value `memory` selects the
/// in-process map.
pub fn from_config(cfg: &PersistenceConfig) -> Result<Arc<dyn Storage>> {
    let endpoint = cfg
        .endpoints
        .split(',')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    if endpoint == "memory" {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    if endpoint.starts_with("redis://") || endpoint.starts_with("rediss://") {
        return Ok(Arc::new(RedisStorage::connect(&endpoint, cfg.timeout)?));
    }
    Err(CaravelError::new(
        ErrorCode::ConfigurationError,
        format!("Unsupported storage endpoint: {}", endpoint),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory storage backend for tests and development.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create(&self, key: &str, value: &str) -> Result<()> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CaravelError::new(
                ErrorCode::DuplicateKey,
                format!("Key {} already exists", key),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(())
            }
        }
    }

    async fn create_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(true)
            }
        }
    }

    async fn update(&self, key: &str, value: &str) -> Result<()> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                *entry = value.to_string();
                Ok(())
            }
            None => Err(CaravelError::new(
                ErrorCode::KeyNotFound,
                format!("Key {} not found", key),
            )),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed storage for production use.
pub struct RedisStorage {
    client: redis::Client,
    op_timeout: std::time::Duration,
}

impl RedisStorage {
    pub fn connect(url: &str, op_timeout: std::time::Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            CaravelError::with_internal(
                ErrorCode::StorageConnectionFailed,
                "Failed to create storage client",
                e.to_string(),
            )
        })?;
        Ok(Self { client, op_timeout })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        let connect = self.client.get_multiplexed_async_connection();
        match tokio::time::timeout(self.op_timeout, connect).await {
            Err(_) => Err(CaravelError::new(
                ErrorCode::StorageConnectionFailed,
                "Timed out connecting to the store",
            )),
            Ok(result) => result.map_err(|e| {
                CaravelError::with_internal(
                    ErrorCode::StorageConnectionFailed,
                    "Failed to get storage connection",
                    e.to_string(),
                )
            }),
        }
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn create(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if written.is_none() {
            return Err(CaravelError::new(
                ErrorCode::DuplicateKey,
                format!("Key {} already exists", key),
            ));
        }
        debug!(key, "created");
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(written.is_some())
    }

    async fn update(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        if written.is_none() {
            return Err(CaravelError::new(
                ErrorCode::KeyNotFound,
                format!("Key {} not found", key),
            ));
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> =
                redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
            if let Some(value) = value {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
