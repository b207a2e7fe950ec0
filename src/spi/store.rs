//! Quota store implementations
//!
//! The tracker persists its per-day record as one JSON blob under a single
//! well-known key; these stores only need to round-trip that blob.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::QuotaStore;
use crate::api::RouterResult;

/// In-memory store; the default, and the fake used throughout the tests
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value directly, bypassing the tracker (test setup)
    pub async fn seed(&self, key: &str, value: &str) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn load(&self, key: &str) -> RouterResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> RouterResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File-backed store: one JSON object mapping keys to blobs
///
/// Read on first access, rewritten after every mutation. Small enough that
/// whole-file rewrites are fine; durability across restarts is the point,
/// not throughput.
#[derive(Debug)]
pub struct FileQuotaStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileQuotaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    async fn read_map(&self) -> RouterResult<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
                debug!(path = %self.path.display(), error = %e, "Quota file unreadable, starting fresh");
                HashMap::new()
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl QuotaStore for FileQuotaStore {
    async fn load(&self, key: &str) -> RouterResult<Option<String>> {
        let _guard = self.lock.read().await;
        Ok(self.read_map().await?.remove(key))
    }

    async fn save(&self, key: &str, value: &str) -> RouterResult<()> {
        let _guard = self.lock.write().await;
        let mut map = self.read_map().await?;
        map.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(&map)
            .unwrap_or_else(|_| "{}".to_string());
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}
