//! Local file-based state storage backend.
//!
//! Records live under a base directory:
//!
//! ```text
//! <base>/<datacenter>/datacenter.json
//! <base>/<datacenter>/environments/<environment>.json
//! ```
//!
//! Each record has a sibling `.lock` file while an apply is running.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{InfraError, Result, StateError};

use super::lock::{holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{StateKey, StateRecord, STATE_VERSION};

/// Default state directory name, relative to the working directory.
pub const STATE_DIR: &str = ".infragraph";

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    base_dir: PathBuf,
}

impl LocalStateStore {
    /// Creates a store rooted at `./.infragraph`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| InfraError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);
        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Base directory of the store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the record file for a key.
    #[must_use]
    pub fn record_path(&self, key: &StateKey) -> PathBuf {
        self.base_dir.join(key.relative_path())
    }

    fn lock_path(&self, key: &StateKey) -> PathBuf {
        self.record_path(key).with_extension("lock")
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StateError::storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(&self, key: &StateKey) -> Result<Option<LockInfo>> {
        let path = self.lock_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }
                .into());
            }
        };

        let lock = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock file {}: {e}", path.display()),
        })?;
        Ok(Some(lock))
    }

    /// Creates the lock file, failing if one already exists.
    async fn create_lock_file(&self, lock: &LockInfo) -> Result<()> {
        let path = self.lock_path(&lock.key);
        Self::ensure_parent(&path).await?;

        let content = serde_json::to_string_pretty(lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })?;
        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;
        Ok(())
    }

    async fn delete_lock_file(&self, key: &StateKey) -> Result<()> {
        match fs::remove_file(self.lock_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, key: &StateKey) -> Result<Option<StateRecord>> {
        let path = self.record_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state for {key} at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(StateError::storage(format!("Failed to read {}: {e}", path.display())).into());
            }
        };

        info!("Loading state from: {}", path.display());
        let record: StateRecord = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse {}: {e}", path.display()),
        })?;

        if record.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: record.version,
            }
            .into());
        }
        Ok(Some(record))
    }

    async fn save(&self, record: &StateRecord) -> Result<()> {
        let path = self.record_path(&record.key);
        Self::ensure_parent(&path).await?;
        info!("Saving state to: {}", path.display());

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // Write then rename so readers never observe a partial file.
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to create temp state file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write state file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync state file: {e}")))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename state file: {e}")))?;

        debug!("State saved for {}", record.key);
        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<()> {
        let path = self.record_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => info!("Deleted state file: {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StateError::storage(format!("Failed to delete state file: {e}")).into());
            }
        }
        self.delete_lock_file(key).await
    }

    async fn exists(&self, key: &StateKey) -> Result<bool> {
        Ok(fs::try_exists(self.record_path(key)).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, key: &StateKey, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file(key).await? {
            if !existing.is_expired() {
                warn!("State {key} is locked by {}", existing.holder);
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock on {key} found, taking over");
            self.delete_lock_file(key).await?;
        }

        let lock = LockInfo::new(key.clone(), &holder_id(), operation);
        self.create_lock_file(&lock).await?;
        info!(
            "Acquired state lock on {key}: {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock.lock_id
        );
        Ok(lock)
    }

    async fn release_lock(&self, key: &StateKey, lock_id: &str) -> Result<()> {
        match self.read_lock_file(key).await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_lock_file(key).await?;
                info!("Released state lock on {key}");
            }
            Some(existing) => {
                debug!("Lock id mismatch on {key}: expected {lock_id}, found {}", existing.lock_id);
            }
            None => {}
        }
        Ok(())
    }

    async fn force_unlock(&self, key: &StateKey) -> Result<()> {
        warn!("Force unlocking state {key}");
        self.delete_lock_file(key).await
    }

    async fn get_lock_info(&self, key: &StateKey) -> Result<Option<LockInfo>> {
        self.read_lock_file(key).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InfraGraph, InfraGraphNode, NodeKey};
    use crate::plugin::PluginKind;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(key: StateKey) -> StateRecord {
        let mut record = StateRecord::new(key);
        let node = InfraGraphNode::new(NodeKey::new("module", "vpc"), "acme/vpc", PluginKind::Pulumi);
        record.set_graph(InfraGraph::from_parts(vec![node], vec![]));
        record
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, temp) = create_test_store();
        let key = StateKey::datacenter("dc");

        store.save(&record(key.clone())).await.expect("save");
        assert!(temp.path().join("dc/datacenter.json").exists());

        let loaded = store.load(&key).await.expect("load").expect("exists");
        assert_eq!(loaded.key, key);
        assert!(loaded.graph.contains("module/vpc@blue"));
    }

    #[tokio::test]
    async fn test_environment_records_are_separate() {
        let (store, temp) = create_test_store();
        let env = StateKey::environment("dc", "prod");

        store.save(&record(env.clone())).await.expect("save");
        assert!(temp.path().join("dc/environments/prod.json").exists());
        assert!(!store.exists(&StateKey::datacenter("dc")).await.expect("exists"));
        assert!(store.exists(&env).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        let result = store.load(&StateKey::datacenter("dc")).await.expect("load");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_load_rejects_other_versions() {
        let (store, _temp) = create_test_store();
        let mut stale = record(StateKey::datacenter("dc"));
        stale.version = "0.1".to_string();
        store.save(&stale).await.expect("save");

        let err = store.load(&stale.key).await.expect_err("version mismatch");
        assert!(matches!(err, InfraError::State(StateError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let (store, _temp) = create_test_store();
        let key = StateKey::datacenter("dc");
        store.save(&record(key.clone())).await.expect("save");
        store.acquire_lock(&key, "apply").await.expect("lock");

        store.delete(&key).await.expect("delete");
        assert!(!store.exists(&key).await.expect("exists"));
        assert!(!store.is_locked(&key).await.expect("locked"));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();
        let key = StateKey::datacenter("dc");

        let lock = store.acquire_lock(&key, "apply").await.expect("acquire");
        assert!(store.is_locked(&key).await.expect("is_locked"));
        assert_eq!(
            store.get_lock_info(&key).await.expect("info").map(|l| l.operation),
            Some("apply".to_string())
        );

        store.release_lock(&key, &lock.lock_id).await.expect("release");
        assert!(!store.is_locked(&key).await.expect("is_locked"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();
        let key = StateKey::datacenter("dc");

        let _held = store.acquire_lock(&key, "apply").await.expect("first lock");
        let err = store.acquire_lock(&key, "destroy").await.expect_err("second lock");
        assert!(err.is_retryable());

        // Locks are per key.
        store
            .acquire_lock(&StateKey::environment("dc", "prod"), "apply")
            .await
            .expect("other key");
    }

    #[tokio::test]
    async fn test_release_with_wrong_id_keeps_lock() {
        let (store, _temp) = create_test_store();
        let key = StateKey::datacenter("dc");
        store.acquire_lock(&key, "apply").await.expect("acquire");

        store.release_lock(&key, "not-mine").await.expect("release");
        assert!(store.is_locked(&key).await.expect("is_locked"));

        store.force_unlock(&key).await.expect("force");
        assert!(!store.is_locked(&key).await.expect("is_locked"));
    }
}
