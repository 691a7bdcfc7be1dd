//! Bounded temp-file store for downloaded SMB files.
//!
//! Keyed by `(deviceId, normalized remote path)`. Entries older than the
//! cache timeout are unobservable; a deferred cleanup task unlinks the
//! backing file. Eviction is idempotent, so racing a lookup never panics.

use crate::safety::sanitize_for_filesystem;
use oculink_model::DeviceId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, warn};

type CacheKey = (DeviceId, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    local_path: PathBuf,
    inserted_at: Instant,
}

/// Temp-file cache with timeout-based eviction.
#[derive(Debug, Clone)]
pub struct FileCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    root: PathBuf,
    timeout: Duration,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            root: root.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the local path a new download should be written to:
    /// `smb2_<epochMs>_<basename>` under the cache root.
    pub fn local_path_for(&self, remote_path: &str) -> PathBuf {
        let basename = remote_path.rsplit('/').next().unwrap_or(remote_path);
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        self.root
            .join(format!("smb2_{epoch_ms}_{}", sanitize_for_filesystem(basename)))
    }

    /// Fetch a live entry. Misses on expiry or when the backing file has
    /// disappeared underneath us.
    pub async fn get(&self, device: &DeviceId, remote_path: &str) -> Option<PathBuf> {
        let key = (device.clone(), remote_path.to_string());
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if entry.inserted_at.elapsed() >= self.timeout {
            return None;
        }
        if !entry.local_path.exists() {
            return None;
        }
        Some(entry.local_path.clone())
    }

    /// Register a downloaded file and schedule its eviction.
    pub async fn insert(&self, device: &DeviceId, remote_path: &str, local_path: PathBuf) {
        let key = (device.clone(), remote_path.to_string());
        let entry = CacheEntry {
            local_path: local_path.clone(),
            inserted_at: Instant::now(),
        };
        self.entries.write().await.insert(key.clone(), entry);

        let cache = self.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cache.evict(&key.0, &key.1, &local_path).await;
        });
    }

    /// Remove an entry and best-effort unlink its file. Safe to call twice;
    /// a newer entry under the same key (different path) is left alone.
    pub async fn evict(&self, device: &DeviceId, remote_path: &str, expected_path: &Path) {
        let key = (device.clone(), remote_path.to_string());
        {
            let mut entries = self.entries.write().await;
            match entries.get(&key) {
                Some(entry) if entry.local_path == expected_path => {
                    entries.remove(&key);
                }
                _ => {}
            }
        }
        if let Err(e) = tokio::fs::remove_file(expected_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %expected_path.display(), error = %e, "cache cleanup failed");
        } else {
            debug!(path = %expected_path.display(), "evicted cached file");
        }
    }

    /// Best-effort unlink of every backing file.
    pub async fn clear(&self) -> usize {
        let drained: Vec<CacheEntry> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            if let Err(e) = tokio::fs::remove_file(&entry.local_path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %entry.local_path.display(), error = %e, "cache clear failed");
            }
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::from_trusted("device-00000000000a")
    }

    #[tokio::test]
    async fn hit_within_timeout_then_miss_after() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path(), Duration::from_millis(50));

        let local = cache.local_path_for("exports/img.jpg");
        tokio::fs::write(&local, b"bytes").await.unwrap();
        cache.insert(&device(), "exports/img.jpg", local.clone()).await;

        assert_eq!(cache.get(&device(), "exports/img.jpg").await, Some(local.clone()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get(&device(), "exports/img.jpg").await, None);
        // Deferred cleanup also removed the file.
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn missing_backing_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path(), Duration::from_secs(60));

        let local = cache.local_path_for("exports/gone.jpg");
        tokio::fs::write(&local, b"x").await.unwrap();
        cache.insert(&device(), "exports/gone.jpg", local.clone()).await;
        tokio::fs::remove_file(&local).await.unwrap();

        assert_eq!(cache.get(&device(), "exports/gone.jpg").await, None);
    }

    #[tokio::test]
    async fn eviction_is_idempotent_and_scoped_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path(), Duration::from_secs(60));

        let first = dir.path().join("smb2_1_a.jpg");
        tokio::fs::write(&first, b"1").await.unwrap();
        cache.insert(&device(), "a.jpg", first.clone()).await;

        // Replace the entry with a newer download under the same key.
        let second = dir.path().join("smb2_2_a.jpg");
        tokio::fs::write(&second, b"2").await.unwrap();
        cache.insert(&device(), "a.jpg", second.clone()).await;

        // Evicting the stale path must not drop the newer entry.
        cache.evict(&device(), "a.jpg", &first).await;
        cache.evict(&device(), "a.jpg", &first).await;
        assert_eq!(cache.get(&device(), "a.jpg").await, Some(second));
    }

    #[tokio::test]
    async fn clear_unlinks_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path(), Duration::from_secs(60));
        for name in ["a.jpg", "b.jpg"] {
            let local = cache.local_path_for(name);
            tokio::fs::write(&local, b"x").await.unwrap();
            cache.insert(&device(), name, local).await;
        }
        assert_eq!(cache.clear().await, 2);
        assert!(cache.is_empty().await);
    }
}
