//! Persistent stack state.
//!
//! Tracks which resources exist, the inputs they were converged to, their
//! attributes and run history, together with an advisory lock.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, OutputState, ResourceState, ResourceStatus, STATE_VERSION, StackOperation,
    StackState,
};

use std::path::Path;

use crate::config::{StackConfig, StateBackend};
use crate::error::{ConfigError, Result};

/// Opens the store a config asks for.
///
/// Local state defaults to `.taskstack/<environment>` next to the config file.
///
/// # Errors
///
/// Returns an error if an S3 store is configured without a bucket.
pub async fn open_store(config: &StackConfig, config_dir: &Path) -> Result<Box<dyn StateStore>> {
    match config.state.backend {
        StateBackend::Local => {
            let store = config.state.path.as_ref().map_or_else(
                || {
                    LocalStateStore::with_base_dir(
                        config_dir
                            .join(STATE_DIR)
                            .join(&config.project.environment),
                    )
                },
                |path| LocalStateStore::with_state_path(config_dir.join(path)),
            );
            Ok(Box::new(store))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 state requires a bucket", "state.bucket")
            })?;
            let prefix = config.state.prefix.clone().unwrap_or_else(|| {
                format!("{}/{}", config.project.name, config.project.environment)
            });
            Ok(Box::new(
                S3StateStore::new(bucket, Some(&prefix), config.state_region()).await,
            ))
        }
    }
}
