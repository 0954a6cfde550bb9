//! Declarations and dependency graph.
//!
//! This module holds everything a stack is declared with:
//! - [`Value`] and [`Reference`] for deferred inputs
//! - [`Resource`] and [`ResourceKind`] for managed cloud resources
//! - [`LookupQuery`] for read-only queries against existing cloud state
//! - [`Plan`], which records dependency edges as nodes are declared
//! - [`Dag`] and [`Frontier`] for deterministic ordering

mod dag;
mod lookup;
mod plan;
mod resource;
mod value;

pub use dag::{Dag, Frontier};
pub use lookup::LookupQuery;
pub use plan::{LookupHandle, NodeKind, Output, Plan, ProviderConfig, ResourceHandle};
pub use resource::{Resource, ResourceKind, UpdateStrategy};
pub use value::{
    Attributes, DeriveFn, Derived, Reference, Value, plain_string, resolve_properties,
};
