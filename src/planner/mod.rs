//! Planning and execution.
//!
//! This module compares a declared [`Plan`](crate::graph::Plan) with recorded
//! state, previews the resulting changes and runs apply and destroy passes.

mod cancel;
mod diff;
mod executor;
mod plan;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use diff::{ChangeAction, DiffEngine, InputsDigest, SecretMask};
pub use executor::{ApplyExecutor, ApplyReport, DEFAULT_MAX_CONCURRENCY};
pub use plan::{ChangeSet, PlannedChange};
