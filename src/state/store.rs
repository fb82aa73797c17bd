//! State store trait definition.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{StateKey, StateRecord};
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads a record.
    ///
    /// Returns `None` if nothing was stored under the key yet.
    async fn load(&self, key: &StateKey) -> Result<Option<StateRecord>>;

    /// Saves a record under its own key.
    async fn save(&self, record: &StateRecord) -> Result<()>;

    /// Deletes a record and its lock.
    async fn delete(&self, key: &StateKey) -> Result<()>;

    /// Checks if a record exists.
    async fn exists(&self, key: &StateKey) -> Result<bool>;

    /// Acquires the lock on a record.
    ///
    /// Fails with `LockedByOther` while an unexpired lock is held.
    async fn acquire_lock(&self, key: &StateKey, operation: &str) -> Result<LockInfo>;

    /// Releases a lock. Unknown lock ids are ignored.
    async fn release_lock(&self, key: &StateKey, lock_id: &str) -> Result<()>;

    /// Removes any lock on a record regardless of holder.
    async fn force_unlock(&self, key: &StateKey) -> Result<()>;

    /// Gets the current lock, if any.
    async fn get_lock_info(&self, key: &StateKey) -> Result<Option<LockInfo>>;

    /// Checks if a record is locked by an unexpired lock.
    async fn is_locked(&self, key: &StateKey) -> Result<bool> {
        Ok(self
            .get_lock_info(key)
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self, key: &StateKey) -> Result<Option<StateRecord>> {
        (**self).load(key).await
    }

    async fn save(&self, record: &StateRecord) -> Result<()> {
        (**self).save(record).await
    }

    async fn delete(&self, key: &StateKey) -> Result<()> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &StateKey) -> Result<bool> {
        (**self).exists(key).await
    }

    async fn acquire_lock(&self, key: &StateKey, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(key, operation).await
    }

    async fn release_lock(&self, key: &StateKey, lock_id: &str) -> Result<()> {
        (**self).release_lock(key, lock_id).await
    }

    async fn force_unlock(&self, key: &StateKey) -> Result<()> {
        (**self).force_unlock(key).await
    }

    async fn get_lock_info(&self, key: &StateKey) -> Result<Option<LockInfo>> {
        (**self).get_lock_info(key).await
    }

    async fn is_locked(&self, key: &StateKey) -> Result<bool> {
        (**self).is_locked(key).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
