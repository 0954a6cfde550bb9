//! File-based state for single-machine use.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::StackState;
use crate::error::{Result, StackError, StateError};

/// Default state directory, relative to the config file.
pub const STATE_DIR: &str = ".taskstack";

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// State kept as JSON files in a directory.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    base_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

fn corrupted(what: &str, err: impl std::fmt::Display) -> StackError {
    StackError::State(StateError::Corrupted {
        message: format!("{what}: {err}"),
    })
}

fn write_failed(what: &str, err: impl std::fmt::Display) -> StackError {
    StackError::State(StateError::write(format!("{what}: {err}")))
}

fn lock_failed(what: &str, err: impl std::fmt::Display) -> StackError {
    StackError::State(StateError::LockFailed {
        message: format!("{what}: {err}"),
    })
}

impl LocalStateStore {
    /// Stores `state.json` and `state.lock` under `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
        }
    }

    /// Uses an explicit state file; the lock sits next to it.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
            state_path,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| write_failed("cannot create state directory", e))?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(corrupted("cannot read lock file", e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| corrupted("cannot parse lock file", e))
    }

    /// Creates the lock file only if none exists.
    async fn create_lock_file(&self, lock: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;
        let content = serde_json::to_vec_pretty(lock)
            .map_err(|e| StackError::State(StateError::serialization(e.to_string())))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(lock_failed("cannot create lock file", e)),
        };
        file.write_all(&content)
            .await
            .map_err(|e| lock_failed("cannot write lock file", e))?;
        file.sync_all()
            .await
            .map_err(|e| lock_failed("cannot sync lock file", e))?;
        Ok(true)
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(lock_failed("cannot delete lock file", e)),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state at {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => return Err(corrupted("cannot read state file", e)),
        };
        debug!("Loaded state from {}", self.state_path.display());
        let state: StackState = serde_json::from_str(&content)
            .map_err(|e| corrupted("cannot parse state file", e))?;
        Ok(Some(state.check_version()?))
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        self.ensure_dir().await?;
        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| StackError::State(StateError::serialization(e.to_string())))?;

        // Write then rename, so readers never see a partial file.
        let temp_path = self.state_path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| write_failed("cannot create temp state file", e))?;
        file.write_all(&content)
            .await
            .map_err(|e| write_failed("cannot write state file", e))?;
        file.sync_all()
            .await
            .map_err(|e| write_failed("cannot sync state file", e))?;
        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| write_failed("cannot replace state file", e))?;

        debug!(
            "Saved state ({} resources) to {}",
            state.resources.len(),
            self.state_path.display()
        );
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file {}", self.state_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(write_failed("cannot delete state file", e)),
        }
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock = LockInfo::new(holder, operation);
        if self.create_lock_file(&lock).await? {
            info!("Acquired state lock {}", lock.lock_id);
            return Ok(lock);
        }

        match self.read_lock_file().await? {
            Some(existing) if !existing.is_expired() => {
                Err(StackError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }))
            }
            _ => {
                debug!("Taking over expired lock");
                self.delete_lock_file().await?;
                if self.create_lock_file(&lock).await? {
                    info!("Acquired state lock {}", lock.lock_id);
                    Ok(lock)
                } else {
                    Err(lock_failed("lock taken concurrently", &self.lock_path.display()))
                }
            }
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_lock_file().await?;
                info!("Released state lock {lock_id}");
            }
            Some(existing) => debug!(
                "Not releasing lock {lock_id}: held as {}",
                existing.lock_id
            ),
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
