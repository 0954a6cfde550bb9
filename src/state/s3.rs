//! S3-backed state for shared use.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::StackState;
use crate::error::{Result, StackError, StateError};

const STATE_KEY: &str = "state.json";
const LOCK_KEY: &str = "state.lock";

/// State kept as objects under a bucket prefix.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    prefix: String,
}

fn s3_err(err: impl std::fmt::Display) -> StackError {
    StackError::State(StateError::s3(err.to_string()))
}

fn corrupted(what: &str, err: impl std::fmt::Display) -> StackError {
    StackError::State(StateError::Corrupted {
        message: format!("{what}: {err}"),
    })
}

/// `a/b/` from `/a/b`, empty for none.
fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{p}/"),
        _ => String::new(),
    }
}

impl S3StateStore {
    /// Connects using credentials from the environment.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: &str) -> Self {
        let config = aws_config::from_env()
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Uses an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(s3_err(format!("get s3://{}/{key}: {service_err}", self.bucket)));
            }
        };
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| s3_err(format!("read s3://{}/{key}: {e}", self.bucket)))?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| corrupted("state object is not UTF-8", e))
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| s3_err(format!("put s3://{}/{key}: {e}", self.bucket)))?;
        Ok(())
    }

    /// Writes only if the key does not exist yet.
    async fn put_object_if_absent(&self, key: &str, body: Vec<u8>) -> Result<bool> {
        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .if_none_match("*")
            .body(ByteStream::from(body))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .raw_response()
                    .is_some_and(|r| r.status().as_u16() == 412) =>
            {
                Ok(false)
            }
            Err(err) => Err(s3_err(format!("put s3://{}/{key}: {err}", self.bucket))),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_err(format!("delete s3://{}/{key}: {e}", self.bucket)))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);
        match self.get_object(&key).await? {
            Some(json) => {
                let state: StackState = serde_json::from_str(&json)
                    .map_err(|e| corrupted("cannot parse state", e))?;
                Ok(Some(state.check_version()?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        let key = self.key(STATE_KEY);
        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| StackError::State(StateError::serialization(e.to_string())))?;
        self.put_object(&key, body).await?;
        debug!("Saved state to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        info!("Deleting state under s3://{}/{}", self.bucket, self.prefix);
        self.delete_object(&self.key(STATE_KEY)).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(s3_err(format!("head s3://{}/{key}: {service_err}", self.bucket)))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let lock = LockInfo::new(holder, operation);
        let body = serde_json::to_vec_pretty(&lock)
            .map_err(|e| StackError::State(StateError::serialization(e.to_string())))?;

        if !self.put_object_if_absent(&key, body.clone()).await? {
            match self.get_lock_info().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StackError::State(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
                _ => {
                    debug!("Taking over expired lock");
                    self.delete_object(&key).await?;
                    if !self.put_object_if_absent(&key, body).await? {
                        return Err(StackError::State(StateError::LockFailed {
                            message: String::from("lock taken concurrently"),
                        }));
                    }
                }
            }
        }
        info!("Acquired state lock {}", lock.lock_id);
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.get_lock_info().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock {lock_id}");
            }
            Some(existing) => debug!("Not releasing lock {lock_id}: held as {}", existing.lock_id),
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.key(LOCK_KEY)).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| corrupted("cannot parse lock", e)),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("stacks/tasks/dev/")), "stacks/tasks/dev/");
        assert_eq!(normalize_prefix(Some("/stacks")), "stacks/");
    }
}
