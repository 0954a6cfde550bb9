// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

#![warn(dead_code)]
#![warn(unused_imports)]
#![warn(unused_variables)]

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::cognitive_complexity)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # taskstack deploy
//!
//! Dependency-ordered, idempotent provisioning of the taskstack demo on AWS:
//! a static single-page frontend in an S3 website bucket, a CRUD API on an
//! EC2 host, and a private RDS Postgres database.
//!
//! ## Architecture
//!
//! 1. **Declaration**: [`blueprint`] turns `taskstack.deploy.yaml` into a
//!    [`graph::Plan`] of typed resources, lookups and outputs. Every
//!    reference between resources becomes a dependency edge as it is
//!    declared.
//! 2. **Validation**: duplicates, unresolved references, unknown attributes
//!    and cycles are rejected before any cloud call.
//! 3. **Lookups**: read-only queries (default VPC, subnets, machine image,
//!    database password) resolve in their own phase.
//! 4. **Apply**: the [`planner`] schedules resources once their
//!    dependencies complete, with bounded concurrency, recording each
//!    result in [`state`] as it lands. Unchanged resources are only read.
//! 5. **Outputs**: `bucket`, `websiteUrl`, `apiIp`, `apiDns` and `dbHost`.
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`graph`]: Resource declarations and the dependency graph
//! - [`backend`]: Cloud backends (AWS, in-memory)
//! - [`planner`]: Change previews and the apply/destroy scheduler
//! - [`provisioner`]: End-to-end runs with locking and outputs
//! - [`state`]: State storage backends (local, S3)
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: tasks
//!   environment: dev
//!   region: eu-west-1
//!
//! site:
//!   bundle_dir: ../frontend/dist
//!
//! database:
//!   password:
//!     ssm_parameter: /tasks/dev/db-password
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod backend;
pub mod blueprint;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod health;
pub mod planner;
pub mod provisioner;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{Result, StackError};
pub use graph::{Plan, ProviderConfig, Resource, ResourceKind, Value};
pub use planner::{ApplyExecutor, ChangeSet, DiffEngine};
pub use provisioner::{ApplyOutcome, DriftReport, Provisioner};
pub use state::{LocalStateStore, S3StateStore, StackState, StateStore};
