//! Recorded stack state.
//!
//! State is the only memory the planner has between runs: what was created,
//! under which physical name, from which inputs (by hash), and what the
//! backend reported back. Secret values are never stored; inputs are kept
//! only as a hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::backend::ResourceTarget;
use crate::error::StateError;
use crate::graph::{Attributes, Dag, ResourceKind};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Entries kept in [`StackState::history`].
const MAX_HISTORY: usize = 100;

/// Everything recorded about one deployed stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Fingerprint of the plan last applied successfully.
    #[serde(default)]
    pub plan_hash: String,
    /// Resources by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Non-sensitive outputs from the last successful apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputState>,
    /// When the state was last modified.
    pub last_updated: DateTime<Utc>,
    /// Recent apply and destroy runs.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// A single managed resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Logical name in the plan.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Cloud-side name.
    pub physical_name: String,
    /// Provider id.
    pub id: String,
    /// Hash of the resolved inputs it was last converged to.
    pub properties_hash: String,
    /// Per-input hashes, used to tell in-place updates from replacements.
    #[serde(default)]
    pub input_hashes: BTreeMap<String, String>,
    /// Attributes reported by the backend.
    #[serde(default)]
    pub attributes: Attributes,
    /// Resource dependencies at the time of the last apply.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Health of the record.
    #[serde(default)]
    pub status: ResourceStatus,
    /// First successful create.
    pub created_at: DateTime<Utc>,
    /// Last successful create or update.
    pub updated_at: DateTime<Utc>,
}

/// Whether a recorded resource can be trusted as-is.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Converged to `properties_hash`.
    #[default]
    Ready,
    /// An update failed part-way; the next apply converges it again.
    Tainted,
}

/// A recorded output value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputState {
    /// Evaluated value.
    pub value: Json,
}

/// One apply or destroy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// What kind of run it was.
    pub operation: StackOperation,
    /// Plan fingerprint at the time.
    pub plan_hash: String,
    /// Resources touched.
    pub resources: Vec<String>,
    /// Whether the run completed.
    pub success: bool,
    /// Failure description.
    #[serde(default)]
    pub error: Option<String>,
}

/// Kinds of recorded runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StackOperation {
    /// Converging to a plan.
    Apply,
    /// Tearing everything down.
    Destroy,
}

impl StackState {
    /// Rejects state written in a different format.
    pub fn check_version(self) -> Result<Self, StateError> {
        if self.version == STATE_VERSION {
            Ok(self)
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version,
            })
        }
    }

    /// Creates an empty state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            plan_hash: String::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by logical name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Records a resource, keeping its original creation time.
    pub fn set_resource(&mut self, mut resource: ResourceState) {
        if let Some(existing) = self.resources.get(&resource.name) {
            if existing.id == resource.id {
                resource.created_at = existing.created_at;
            }
        }
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Forgets a resource.
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceState> {
        let removed = self.resources.remove(name);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Marks a resource for reconvergence on the next apply.
    pub fn taint(&mut self, name: &str) {
        if let Some(resource) = self.resources.get_mut(name) {
            resource.status = ResourceStatus::Tainted;
            self.last_updated = Utc::now();
        }
    }

    /// Appends a history entry, dropping the oldest beyond the cap.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Recorded resource names, sorted.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Dependency graph as recorded, limited to resources still in state.
    #[must_use]
    pub fn dependency_graph(&self) -> Dag {
        let mut dag = Dag::new();
        for (name, resource) in &self.resources {
            dag.add_node(name);
            for dep in &resource.dependencies {
                if self.resources.contains_key(dep) {
                    dag.add_edge(dep, name);
                }
            }
        }
        dag
    }

    /// Attributes of every recorded resource, keyed by logical name.
    #[must_use]
    pub fn attribute_map(&self) -> HashMap<String, Attributes> {
        self.resources
            .iter()
            .map(|(name, r)| (name.clone(), r.attributes.clone()))
            .collect()
    }
}

impl ResourceState {
    /// Creates a ready record from fresh backend attributes.
    #[must_use]
    pub fn new(
        name: &str,
        kind: ResourceKind,
        physical_name: &str,
        properties_hash: &str,
        attributes: Attributes,
    ) -> Self {
        let now = Utc::now();
        let id = attributes
            .get("id")
            .and_then(Json::as_str)
            .unwrap_or(physical_name)
            .to_string();
        Self {
            name: name.to_string(),
            kind,
            physical_name: physical_name.to_string(),
            id,
            properties_hash: properties_hash.to_string(),
            input_hashes: BTreeMap::new(),
            attributes,
            dependencies: BTreeSet::new(),
            status: ResourceStatus::Ready,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the per-input hashes.
    #[must_use]
    pub fn with_input_hashes(mut self, input_hashes: BTreeMap<String, String>) -> Self {
        self.input_hashes = input_hashes;
        self
    }

    /// Backend handle for reads and deletes.
    #[must_use]
    pub fn target(&self) -> ResourceTarget {
        ResourceTarget {
            logical_name: self.name.clone(),
            physical_name: self.physical_name.clone(),
            kind: self.kind,
            attributes: self.attributes.clone(),
        }
    }

    /// Whether the record is converged.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.status, ResourceStatus::Ready)
    }
}

impl HistoryEntry {
    /// A successful run.
    #[must_use]
    pub fn new(operation: StackOperation, plan_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            plan_hash: plan_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// A run that stopped on an error.
    #[must_use]
    pub fn failed(
        operation: StackOperation,
        plan_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, plan_hash, resources)
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Tainted => write!(f, "tainted"),
        }
    }
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str, deps: &[&str]) -> ResourceState {
        ResourceState::new(
            name,
            ResourceKind::SecurityGroup,
            &format!("demo-dev-{name}"),
            "hash",
            Attributes::from([("id".to_string(), json!(format!("sg-{name}")))]),
        )
        .with_dependencies(deps.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn test_id_comes_from_attributes() {
        let r = record("api-sg", &[]);
        assert_eq!(r.id, "sg-api-sg");
        assert!(r.is_ready());
        assert_eq!(r.target().physical_name, "demo-dev-api-sg");
    }

    #[test]
    fn test_set_resource_keeps_created_at() {
        let mut state = StackState::new("demo", "dev");
        let first = record("api-sg", &[]);
        let created = first.created_at;
        state.set_resource(first);

        let mut second = record("api-sg", &[]);
        second.properties_hash = String::from("changed");
        state.set_resource(second);

        let stored = state.resource("api-sg").unwrap();
        assert_eq!(stored.created_at, created);
        assert_eq!(stored.properties_hash, "changed");
    }

    #[test]
    fn test_taint() {
        let mut state = StackState::new("demo", "dev");
        state.set_resource(record("db", &[]));
        state.taint("db");
        assert_eq!(state.resource("db").unwrap().status, ResourceStatus::Tainted);
        state.taint("missing");
    }

    #[test]
    fn test_dependency_graph_skips_forgotten_resources() {
        let mut state = StackState::new("demo", "dev");
        state.set_resource(record("db-sg", &["api-sg", "vpc"]));
        state.set_resource(record("api-sg", &[]));

        let dag = state.dependency_graph();
        assert_eq!(dag.len(), 2);
        assert_eq!(dag.topological_order().unwrap(), vec!["api-sg", "db-sg"]);
        assert!(!dag.contains("vpc"));
    }

    #[test]
    fn test_history_is_capped() {
        let mut state = StackState::new("demo", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(HistoryEntry::new(
                StackOperation::Apply,
                &i.to_string(),
                Vec::new(),
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].plan_hash, "5");
    }

    #[test]
    fn test_state_roundtrip_keeps_status() {
        let mut state = StackState::new("demo", "dev");
        state.set_resource(record("api", &["api-sg"]));
        state.taint("api");
        state.outputs.insert(
            String::from("apiIp"),
            OutputState {
                value: json!("203.0.113.10"),
            },
        );

        let text = serde_json::to_string(&state).unwrap();
        assert!(text.contains("\"tainted\""));
        let back: StackState = serde_json::from_str(&text).unwrap();
        assert_eq!(back.resources, state.resources);
        assert_eq!(back.outputs, state.outputs);
    }
}
