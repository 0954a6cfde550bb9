//! In-process state, paired with the memory backend.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::StackState;
use crate::error::{Result, StackError, StateError};

/// State held in memory; lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<StackState>>,
    lock: Mutex<Option<LockInfo>>,
    saves: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
}

fn poisoned() -> StackError {
    StackError::internal("state mutex poisoned")
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from existing state.
    #[must_use]
    pub fn with_state(state: StackState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    /// Makes every save after the first `n` fail.
    pub fn fail_saves_after(&self, n: usize) {
        if let Ok(mut guard) = self.fail_after.lock() {
            *guard = Some(n);
        }
    }

    /// Successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Current state without going through the trait.
    #[must_use]
    pub fn snapshot(&self) -> Option<StackState> {
        self.state.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        Ok(self.state.lock().map_err(|_| poisoned())?.clone())
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        let limit = *self.fail_after.lock().map_err(|_| poisoned())?;
        if limit.is_some_and(|n| self.saves.load(Ordering::SeqCst) >= n) {
            return Err(StackError::State(StateError::write("injected save failure")));
        }
        *self.state.lock().map_err(|_| poisoned())? = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.state.lock().map_err(|_| poisoned())? = None;
        *self.lock.lock().map_err(|_| poisoned())? = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().map_err(|_| poisoned())?.is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().map_err(|_| poisoned())?;
        if let Some(existing) = guard.as_ref().filter(|l| !l.is_expired()) {
            return Err(StackError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }
        let lock = LockInfo::new(holder, operation);
        *guard = Some(lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().map_err(|_| poisoned())?;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().map_err(|_| poisoned())?.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_save_failure() {
        let store = MemoryStateStore::new();
        store.fail_saves_after(1);
        let state = StackState::new("tasks", "dev");

        store.save(&state).await.unwrap();
        assert!(store.save(&state).await.is_err());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("a", "apply").await.unwrap();
        assert!(store.acquire_lock("b", "apply").await.is_err());
        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(store.acquire_lock("b", "apply").await.is_ok());
    }
}
