//! Advisory lock records.
//!
//! A lock is a small JSON document stored next to the state. It expires so
//! that a crashed run cannot wedge the stack forever.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds before an unreleased lock may be taken over.
///
/// Database creation alone can take well over ten minutes.
pub const LOCK_EXPIRY_SECS: i64 = 3600;

/// A held lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique id, needed to release.
    pub lock_id: String,
    /// Who holds it.
    pub holder: String,
    /// What the holder is doing.
    #[serde(default)]
    pub operation: String,
    /// When it was taken.
    pub acquired_at: DateTime<Utc>,
    /// When it lapses.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Takes a fresh lock for `holder`; an empty holder gets a generated id.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Whether the lock has lapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Seconds left before it lapses.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Identifier for this process: `host-pid-random`.
#[must_use]
pub fn generate_holder_id() -> String {
    let host = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().into_owned(),
    );
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci", "apply");
        assert_eq!(lock.holder, "ci");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 60);
    }

    #[test]
    fn test_empty_holder_is_generated() {
        let lock = LockInfo::new("", "destroy");
        assert!(lock.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("ci", "apply");
        lock.expires_at = Utc::now() - Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_holder_ids_are_unique() {
        assert_ne!(generate_holder_id(), generate_holder_id());
    }
}
