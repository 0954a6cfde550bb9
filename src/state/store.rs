//! State store trait.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::StackState;
use crate::error::Result;

/// Where stack state and its lock live.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state; `None` before the first apply.
    async fn load(&self) -> Result<Option<StackState>>;

    /// Persists the state.
    async fn save(&self, state: &StackState) -> Result<()>;

    /// Removes the state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Whether any state is stored.
    async fn exists(&self) -> Result<bool>;

    /// Takes the lock.
    ///
    /// Fails with `LockedByOther` while someone else holds an unexpired lock.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Current lock, expired or not.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Whether an unexpired lock is held.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Store name for logs.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StackState>> {
        (**self).load().await
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
