//! S3-based state storage backend.
//!
//! Uses the same layout as the local backend below an optional key prefix,
//! so state can be moved between backends by copying files.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{StateKey, StateRecord, STATE_VERSION};

/// S3-based state store.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{p}/"),
        _ => String::new(),
    }
}

impl S3StateStore {
    /// Creates a store using credentials from the environment.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = match region {
            Some(region) => {
                aws_config::from_env()
                    .region(aws_config::Region::new(region.to_string()))
                    .load()
                    .await
            }
            None => aws_config::load_from_env().await,
        };
        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn record_key(&self, key: &StateKey) -> String {
        format!("{}{}", self.prefix, key.relative_path())
    }

    fn lock_key(&self, key: &StateKey) -> String {
        let record = self.record_key(key);
        let stem = record.strip_suffix(".json").unwrap_or(&record);
        format!("{stem}.lock")
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;
                let content = String::from_utf8(bytes.to_vec()).map_err(|e| StateError::Corrupted {
                    message: format!("Invalid UTF-8 in S3 object: {e}"),
                })?;
                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, key: &StateKey) -> Result<Option<StateRecord>> {
        let object = self.record_key(key);
        debug!("Loading state from s3://{}/{object}", self.bucket);

        let Some(json) = self.get_object(&object).await? else {
            debug!("No state found for {key}");
            return Ok(None);
        };

        let record: StateRecord = serde_json::from_str(&json).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })?;
        if record.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: record.version,
            }
            .into());
        }

        info!("Loaded state for {key} ({} nodes)", record.graph.len());
        Ok(Some(record))
    }

    async fn save(&self, record: &StateRecord) -> Result<()> {
        let object = self.record_key(&record.key);
        info!("Saving state to s3://{}/{object}", self.bucket);

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;
        self.put_object(&object, content).await
    }

    async fn delete(&self, key: &StateKey) -> Result<()> {
        let object = self.record_key(key);
        info!("Deleting state from s3://{}/{object}", self.bucket);
        self.delete_object(&object).await?;
        self.delete_object(&self.lock_key(key)).await
    }

    async fn exists(&self, key: &StateKey) -> Result<bool> {
        self.object_exists(&self.record_key(key)).await
    }

    async fn acquire_lock(&self, key: &StateKey, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.get_lock_info(key).await? {
            if !existing.is_expired() {
                warn!("State {key} is locked by {}", existing.holder);
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock on {key} found, taking over");
        }

        let lock = LockInfo::new(key.clone(), &holder_id(), operation);
        let content = serde_json::to_string_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.put_object(&self.lock_key(key), content).await?;

        info!(
            "Acquired state lock on {key}: {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock.lock_id
        );
        Ok(lock)
    }

    async fn release_lock(&self, key: &StateKey, lock_id: &str) -> Result<()> {
        match self.get_lock_info(key).await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_object(&self.lock_key(key)).await?;
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
        self.delete_object(&self.lock_key(key)).await
    }

    async fn get_lock_info(&self, key: &StateKey) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.lock_key(key)).await? else {
            return Ok(None);
        };
        let lock = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })?;
        Ok(Some(lock))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
