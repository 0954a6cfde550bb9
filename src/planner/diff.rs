//! Desired-versus-recorded comparison.
//!
//! The same decision table drives the preview and the apply pass:
//!
//! | recorded | inputs hash | action |
//! |----------|-------------|--------|
//! | no       | -           | create |
//! | yes      | equal       | none (apply verifies the resource still exists) |
//! | yes      | different   | update, or replace for kinds that cannot update |
//!
//! A change to an input the backend cannot modify (a security group's VPC, a
//! database engine) replaces the resource even for kinds that update in
//! place. Secret lookup values never enter a hash: they are masked by the
//! secret's id and version first.
//!
//! Recorded resources that are no longer declared are deleted.

use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::PlanError;
use crate::graph::{Attributes, Plan, ResourceKind, UpdateStrategy, resolve_properties};
use crate::state::{ResourceState, StackState};

use super::plan::{ChangeSet, PlannedChange};

/// What happens to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Does not exist yet.
    Create,
    /// Converged in place.
    Update,
    /// Deleted and created again.
    Replace,
    /// Already converged.
    NoChange,
    /// No longer declared.
    Delete,
    /// Inputs depend on values only known after apply.
    Pending,
}

/// Hashes of one resource's resolved, secret-masked inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputsDigest {
    /// Hash over every input.
    pub hash: String,
    /// Hash of each input on its own.
    pub keys: BTreeMap<String, String>,
}

/// Resolved secret values and the tokens that stand in for them in hashes.
#[derive(Debug, Clone, Default)]
pub struct SecretMask {
    secrets: Vec<(String, String)>,
}

impl SecretMask {
    /// Collects the values of every resolved sensitive lookup in `plan`.
    #[must_use]
    pub fn from_lookups(plan: &Plan, lookups: &HashMap<String, Attributes>) -> Self {
        let mut secrets: Vec<(String, String)> = plan
            .lookups()
            .iter()
            .filter(|(_, query)| query.is_sensitive())
            .filter_map(|(name, _)| {
                let attrs = lookups.get(name)?;
                let value = attrs.get("value").and_then(Json::as_str)?;
                if value.is_empty() {
                    return None;
                }
                let id = attrs.get("id").and_then(Json::as_str).unwrap_or(name);
                let version = attrs
                    .get("version")
                    .map_or_else(|| String::from("unversioned"), ToString::to_string);
                Some((value.to_string(), format!("<secret {id} version {version}>")))
            })
            .collect();
        // Longest first so a secret containing another is masked whole.
        secrets.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { secrets }
    }

    /// Returns `properties` with every secret occurrence replaced.
    #[must_use]
    pub fn apply(&self, properties: &Attributes) -> Attributes {
        properties
            .iter()
            .map(|(key, value)| (key.clone(), self.mask(value)))
            .collect()
    }

    fn mask(&self, value: &Json) -> Json {
        match value {
            Json::String(text) => Json::String(
                self.secrets
                    .iter()
                    .fold(text.clone(), |acc, (secret, token)| acc.replace(secret, token)),
            ),
            Json::Array(items) => Json::Array(items.iter().map(|v| self.mask(v)).collect()),
            Json::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Computes change sets and per-resource decisions.
#[derive(Debug, Default)]
pub struct DiffEngine {
    hasher: ConfigHasher,
}

impl DiffEngine {
    /// Creates an engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Stable hashes of resolved inputs, with secrets masked.
    #[must_use]
    pub fn digest(&self, properties: &Attributes, mask: &SecretMask) -> InputsDigest {
        let masked = mask.apply(properties);
        let keys = masked
            .iter()
            .map(|(key, value)| (key.clone(), self.hasher.hash_value(value)))
            .collect();
        let hash = self
            .hasher
            .hash_value(&Json::Object(masked.into_iter().collect()));
        InputsDigest { hash, keys }
    }

    /// Decides the action for a resource whose inputs are fully resolved.
    #[must_use]
    pub fn decide(
        kind: ResourceKind,
        recorded: Option<&ResourceState>,
        digest: &InputsDigest,
    ) -> ChangeAction {
        let Some(r) = recorded else {
            return ChangeAction::Create;
        };
        if r.is_ready() && ConfigHasher::hashes_match(&r.properties_hash, &digest.hash) {
            return ChangeAction::NoChange;
        }
        let immutable_changed = kind
            .immutable_inputs()
            .iter()
            .any(|key| digest.keys.get(*key) != r.input_hashes.get(*key));
        match kind.update_strategy() {
            UpdateStrategy::InPlace if !immutable_changed => ChangeAction::Update,
            _ => ChangeAction::Replace,
        }
    }

    /// Previews an apply.
    ///
    /// `lookups` holds resolved lookup attributes; `missing` names recorded
    /// resources the backend no longer has.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the plan is invalid.
    pub fn compute(
        &self,
        plan: &Plan,
        state: Option<&StackState>,
        lookups: &HashMap<String, Attributes>,
        missing: &BTreeSet<String>,
    ) -> Result<ChangeSet, PlanError> {
        let order = plan.apply_order()?;
        let provider = plan.provider();
        let mask = SecretMask::from_lookups(plan, lookups);
        let mut known = lookups.clone();
        let mut changes = Vec::new();

        for name in order {
            let Some(resource) = plan.resources().get(&name) else {
                continue;
            };
            let recorded = state.and_then(|s| s.resource(&name));
            let physical_name = provider.physical_name(&name, resource.kind);

            let (action, reason) = match (recorded, resolve_properties(&resource.properties, &known)) {
                (None, _) => (ChangeAction::Create, String::from("not yet created")),
                (Some(_), _) if missing.contains(&name) => (
                    ChangeAction::Create,
                    String::from("recorded but missing from the cloud"),
                ),
                (Some(r), Ok(props)) => {
                    let action =
                        Self::decide(resource.kind, Some(r), &self.digest(&props, &mask));
                    let reason = match action {
                        ChangeAction::NoChange => String::from("up to date"),
                        _ if !r.is_ready() => String::from("previous update did not finish"),
                        ChangeAction::Replace
                            if resource.kind.update_strategy() == UpdateStrategy::InPlace =>
                        {
                            String::from("an input that cannot be modified changed")
                        }
                        ChangeAction::Replace => {
                            format!("inputs changed; {} cannot be updated in place", resource.kind)
                        }
                        _ => String::from("inputs changed"),
                    };
                    (action, reason)
                }
                (Some(_), Err(reference)) => (
                    ChangeAction::Pending,
                    format!("depends on {reference}, known after apply"),
                ),
            };

            if action == ChangeAction::NoChange {
                if let Some(r) = recorded {
                    known.insert(name.clone(), r.attributes.clone());
                }
            }
            debug!("{name}: {action}");
            changes.push(PlannedChange {
                name,
                kind: resource.kind,
                physical_name,
                action,
                reason,
            });
        }

        if let Some(state) = state {
            changes.extend(Self::orphans(plan, state).into_iter().map(|r| PlannedChange {
                name: r.name.clone(),
                kind: r.kind,
                physical_name: r.physical_name.clone(),
                action: ChangeAction::Delete,
                reason: String::from("no longer declared"),
            }));
        }

        Ok(ChangeSet::new(plan.fingerprint(), changes))
    }

    /// Recorded resources the plan no longer declares, in deletion order.
    #[must_use]
    pub fn orphans<'s>(plan: &Plan, state: &'s StackState) -> Vec<&'s ResourceState> {
        let names: BTreeSet<String> = state
            .resources
            .keys()
            .filter(|n| !plan.resources().contains_key(*n))
            .cloned()
            .collect();
        let order = state
            .dependency_graph()
            .subgraph(&names)
            .reversed()
            .topological_order()
            .unwrap_or_else(|_| names.iter().rev().cloned().collect());
        order.iter().filter_map(|n| state.resource(n)).collect()
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::NoChange => "no change",
            Self::Delete => "delete",
            Self::Pending => "update?",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ProviderConfig, Resource};
    use serde_json::json;

    fn plan() -> Plan {
        let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        let api_sg = plan
            .declare(Resource::new("api-sg", ResourceKind::SecurityGroup).with("vpc_id", "vpc-1"))
            .unwrap();
        plan.declare(
            Resource::new("db-sg", ResourceKind::SecurityGroup)
                .with("vpc_id", "vpc-1")
                .with("source", api_sg.id()),
        )
        .unwrap();
        plan
    }

    fn recorded(engine: &DiffEngine, name: &str, props: &Attributes, id: &str) -> ResourceState {
        ResourceState::new(
            name,
            ResourceKind::SecurityGroup,
            &format!("tasks-dev-{name}"),
            &digest(engine, props).hash,
            Attributes::from([("id".to_string(), json!(id))]),
        )
        .with_input_hashes(digest(engine, props).keys)
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let engine = DiffEngine::new();
        let changes = engine
            .compute(&plan(), None, &HashMap::new(), &BTreeSet::new())
            .unwrap();
        assert_eq!(changes.count(ChangeAction::Create), 2);
        assert_eq!(changes.changes()[0].name, "api-sg");
        assert_eq!(changes.changes()[0].physical_name, "tasks-dev-api-sg");
    }

    #[test]
    fn test_unchanged_resources_feed_dependents() {
        let engine = DiffEngine::new();
        let api_props = Attributes::from([("vpc_id".to_string(), json!("vpc-1"))]);
        let db_props = Attributes::from([
            ("vpc_id".to_string(), json!("vpc-1")),
            ("source".to_string(), json!("sg-api")),
        ]);
        let mut state = StackState::new("tasks", "dev");
        state.set_resource(recorded(&engine, "api-sg", &api_props, "sg-api"));
        state.set_resource(recorded(&engine, "db-sg", &db_props, "sg-db"));

        let changes = engine
            .compute(&plan(), Some(&state), &HashMap::new(), &BTreeSet::new())
            .unwrap();
        assert!(!changes.has_changes());
        assert_eq!(changes.count(ChangeAction::NoChange), 2);
    }

    #[test]
    fn test_changed_producer_makes_consumer_pending() {
        let engine = DiffEngine::new();
        let old_props = Attributes::from([("vpc_id".to_string(), json!("vpc-old"))]);
        let mut state = StackState::new("tasks", "dev");
        state.set_resource(recorded(&engine, "api-sg", &old_props, "sg-api"));
        state.set_resource(recorded(&engine, "db-sg", &old_props, "sg-db"));

        let changes = engine
            .compute(&plan(), Some(&state), &HashMap::new(), &BTreeSet::new())
            .unwrap();
        let actions: Vec<_> = changes.changes().iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![ChangeAction::Replace, ChangeAction::Pending]);
        assert!(changes.changes()[0].reason.contains("cannot be modified"));
    }

    #[test]
    fn test_missing_and_orphaned() {
        let engine = DiffEngine::new();
        let api_props = Attributes::from([("vpc_id".to_string(), json!("vpc-1"))]);
        let mut state = StackState::new("tasks", "dev");
        state.set_resource(recorded(&engine, "api-sg", &api_props, "sg-api"));
        state.set_resource(
            recorded(&engine, "old-sg", &api_props, "sg-old")
                .with_dependencies(BTreeSet::from([String::from("older-sg")])),
        );
        state.set_resource(recorded(&engine, "older-sg", &api_props, "sg-older"));

        let missing = BTreeSet::from([String::from("api-sg")]);
        let changes = engine
            .compute(&plan(), Some(&state), &HashMap::new(), &missing)
            .unwrap();

        let api = &changes.changes()[0];
        assert_eq!(api.action, ChangeAction::Create);
        assert!(api.reason.contains("missing"));

        let deletes: Vec<_> = changes
            .changes()
            .iter()
            .filter(|c| c.action == ChangeAction::Delete)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(deletes, vec!["old-sg", "older-sg"]);
    }

    fn digest(engine: &DiffEngine, props: &Attributes) -> InputsDigest {
        engine.digest(props, &SecretMask::default())
    }

    #[test]
    fn test_decide() {
        let engine = DiffEngine::new();
        let props = Attributes::from([("ami".to_string(), json!("ami-1"))]);
        let same = digest(&engine, &props);
        let other = digest(
            &engine,
            &Attributes::from([("ami".to_string(), json!("ami-2"))]),
        );
        let mut instance = ResourceState::new(
            "api",
            ResourceKind::Instance,
            "tasks-dev-api",
            &same.hash,
            Attributes::new(),
        )
        .with_input_hashes(same.keys.clone());

        assert_eq!(
            DiffEngine::decide(ResourceKind::Instance, None, &same),
            ChangeAction::Create
        );
        assert_eq!(
            DiffEngine::decide(ResourceKind::Instance, Some(&instance), &same),
            ChangeAction::NoChange
        );
        assert_eq!(
            DiffEngine::decide(ResourceKind::Instance, Some(&instance), &other),
            ChangeAction::Replace
        );
        assert_eq!(
            DiffEngine::decide(ResourceKind::DbInstance, Some(&instance), &other),
            ChangeAction::Update
        );

        instance.status = crate::state::ResourceStatus::Tainted;
        assert_eq!(
            DiffEngine::decide(ResourceKind::DbInstance, Some(&instance), &same),
            ChangeAction::Update
        );
    }

    #[test]
    fn test_immutable_input_change_replaces() {
        let engine = DiffEngine::new();
        let db = |version: &str, engine_name: &str| {
            Attributes::from([
                ("engine".to_string(), json!(engine_name)),
                ("engine_version".to_string(), json!(version)),
            ])
        };
        let before = digest(&engine, &db("16", "postgres"));
        let record = ResourceState::new(
            "db",
            ResourceKind::DbInstance,
            "tasks-dev-db",
            &before.hash,
            Attributes::new(),
        )
        .with_input_hashes(before.keys);

        assert_eq!(
            DiffEngine::decide(
                ResourceKind::DbInstance,
                Some(&record),
                &digest(&engine, &db("17", "postgres"))
            ),
            ChangeAction::Update
        );
        assert_eq!(
            DiffEngine::decide(
                ResourceKind::DbInstance,
                Some(&record),
                &digest(&engine, &db("16", "mysql"))
            ),
            ChangeAction::Replace
        );
    }

    #[test]
    fn test_secret_values_never_enter_hashes() {
        let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        let password = plan
            .lookup(
                "db-password",
                crate::graph::LookupQuery::Secret {
                    source: crate::config::SecretSource::SsmParameter("/tasks/dev/db".into()),
                },
            )
            .unwrap();
        plan.declare(
            Resource::new("db", ResourceKind::DbInstance).with("password", password.attr("value")),
        )
        .unwrap();

        let secret = |value: &str, version: i64| {
            HashMap::from([(
                String::from("db-password"),
                Attributes::from([
                    ("id".to_string(), json!("/tasks/dev/db")),
                    ("value".to_string(), json!(value)),
                    ("version".to_string(), json!(version)),
                ]),
            )])
        };
        let engine = DiffEngine::new();
        let props = Attributes::from([("password".to_string(), json!("hunter2"))]);
        let mask = SecretMask::from_lookups(&plan, &secret("hunter2", 1));
        let masked = engine.digest(&props, &mask);

        assert_ne!(masked.hash, digest(&engine, &props).hash);
        assert_ne!(
            masked.keys["password"],
            ConfigHasher::new().hash_value(&json!("hunter2"))
        );
        assert!(mask.apply(&props)["password"].as_str().unwrap().contains("version 1"));

        let rotated = SecretMask::from_lookups(&plan, &secret("correct-horse", 2));
        let after = engine.digest(
            &Attributes::from([("password".to_string(), json!("correct-horse"))]),
            &rotated,
        );
        assert_ne!(masked.hash, after.hash);
    }
}
