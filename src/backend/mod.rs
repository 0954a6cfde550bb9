//! Cloud backends.
//!
//! A [`CloudBackend`] performs the individual create/read/update/delete
//! calls and lookups the scheduler asks for. It knows nothing about the
//! dependency graph.

mod aws;
mod memory;
mod retry;

pub use aws::AwsBackend;
pub use memory::{BackendCall, FailureMode, MemoryBackend, Operation};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::BackendError;
use crate::graph::{Attributes, ResourceKind};

/// Result of a backend call.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A lookup with every reference already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum LookupRequest {
    /// The default VPC.
    DefaultVpc,
    /// Subnets of a VPC.
    Subnets {
        /// VPC id.
        vpc_id: String,
    },
    /// Most recent image matching a pattern.
    LatestAmi {
        /// Owner account ids.
        owners: Vec<String>,
        /// Name glob.
        name_pattern: String,
    },
    /// An SSM parameter, decrypted.
    SsmParameter {
        /// Parameter name.
        name: String,
    },
}

impl fmt::Display for LookupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultVpc => write!(f, "default_vpc"),
            Self::Subnets { vpc_id } => write!(f, "subnets({vpc_id})"),
            Self::LatestAmi { name_pattern, .. } => write!(f, "latest_ami({name_pattern})"),
            Self::SsmParameter { name } => write!(f, "ssm_parameter({name})"),
        }
    }
}

/// A create or update call with fully resolved inputs.
#[derive(Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Logical name in the plan.
    pub logical_name: String,
    /// Deterministic cloud-side name.
    pub physical_name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resolved inputs.
    pub properties: Attributes,
    /// Tags to apply where supported.
    pub tags: BTreeMap<String, String>,
    /// Stable token for backends with client-side idempotency keys.
    pub idempotency_token: String,
}

impl ResourceRequest {
    /// Reads a string property.
    ///
    /// # Errors
    ///
    /// Returns an error if the property is missing or not a string.
    pub fn str_prop(&self, key: &str) -> BackendResult<&str> {
        self.properties
            .get(key)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                BackendError::invalid(
                    &self.logical_name,
                    format!("property '{key}' is missing or not a string"),
                )
            })
    }

    /// Reads an optional boolean property.
    #[must_use]
    pub fn bool_prop(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(serde_json::Value::as_bool)
    }

    /// Reads a list-of-strings property (missing means empty).
    ///
    /// # Errors
    ///
    /// Returns an error if the property is not a list of strings.
    pub fn str_list_prop(&self, key: &str) -> BackendResult<Vec<String>> {
        let Some(value) = self.properties.get(key) else {
            return Ok(Vec::new());
        };
        value
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| {
                BackendError::invalid(
                    &self.logical_name,
                    format!("property '{key}' is not a list of strings"),
                )
            })
    }
}

// Inputs can carry secrets, so only keys are shown.
impl fmt::Debug for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRequest")
            .field("logical_name", &self.logical_name)
            .field("physical_name", &self.physical_name)
            .field("kind", &self.kind)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Identity of an existing resource, as recorded in state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTarget {
    /// Logical name in the plan.
    pub logical_name: String,
    /// Cloud-side name.
    pub physical_name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Attributes returned when the resource was last created or updated.
    pub attributes: Attributes,
}

impl ResourceTarget {
    /// Reads a string attribute.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute is missing or not a string.
    pub fn str_attr(&self, key: &str) -> BackendResult<&str> {
        self.attributes
            .get(key)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                BackendError::invalid(
                    &self.logical_name,
                    format!("recorded attribute '{key}' is missing"),
                )
            })
    }
}

/// Operations a cloud provider must support for the planner.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Resolves a read-only lookup.
    async fn lookup(&self, request: &LookupRequest) -> BackendResult<Attributes>;

    /// Creates a resource and returns its attributes.
    ///
    /// Must be idempotent for the same physical name: creating a resource
    /// that already exists with that name returns the existing one.
    async fn create(&self, request: &ResourceRequest) -> BackendResult<Attributes>;

    /// Reads a resource; `None` if it no longer exists.
    async fn read(&self, target: &ResourceTarget) -> BackendResult<Option<Attributes>>;

    /// Converges an existing resource to new inputs in place.
    async fn update(
        &self,
        request: &ResourceRequest,
        current: &ResourceTarget,
    ) -> BackendResult<Attributes>;

    /// Deletes a resource. Deleting a missing resource succeeds.
    async fn delete(&self, target: &ResourceTarget) -> BackendResult<()>;

    /// Backend name for logs and reports.
    fn backend_type(&self) -> &'static str;
}
