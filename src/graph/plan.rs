//! The declared provisioning plan.
//!
//! A [`Plan`] owns every resource, lookup and output declared for one stack,
//! together with the dependency edges recorded at declaration time.

use serde::Serialize;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use super::dag::Dag;
use super::lookup::LookupQuery;
use super::resource::{Resource, ResourceKind};
use super::value::{Attributes, Reference, Value};
use crate::config::{ConfigHasher, StackConfig};
use crate::error::PlanError;

/// Explicit provider settings passed to the plan; there is no ambient
/// provider state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderConfig {
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Region every resource is created in.
    pub region: String,
    /// Tags applied to every taggable resource.
    pub tags: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// Creates provider settings.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        environment: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
            region: region.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Builds provider settings from a stack configuration.
    #[must_use]
    pub fn from_config(config: &StackConfig) -> Self {
        Self {
            project: config.project.name.clone(),
            environment: config.project.environment.clone(),
            region: config.project.region.clone(),
            tags: config.tags.clone(),
        }
    }

    /// Deterministic physical name for a logical resource.
    ///
    /// Globally scoped names (buckets) get a stable suffix derived from
    /// project, environment, region and logical name.
    #[must_use]
    pub fn physical_name(&self, logical: &str, kind: ResourceKind) -> String {
        let base = format!("{}-{}-{logical}", self.project, self.environment);
        if kind.is_globally_named() {
            let hasher = ConfigHasher::new();
            let digest = hasher.hash_str(&format!("{}/{base}", self.region));
            format!("{base}-{}", hasher.short_hash(&digest))
        } else {
            base
        }
    }

    /// Tags for one resource: user tags plus ownership tags.
    #[must_use]
    pub fn tags_for(&self, logical: &str, physical: &str) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        tags.entry(String::from("Name"))
            .or_insert_with(|| physical.to_string());
        tags.insert(String::from("taskstack:project"), self.project.clone());
        tags.insert(String::from("taskstack:environment"), self.environment.clone());
        tags.insert(String::from("taskstack:logical-name"), logical.to_string());
        tags
    }
}

/// Handle to a declared resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    name: String,
    kind: ResourceKind,
}

impl ResourceHandle {
    /// Logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Deferred reference to one of the resource's attributes.
    #[must_use]
    pub fn attr(&self, attribute: &str) -> Value {
        Value::Ref(Reference::new(&self.name, attribute))
    }

    /// Shorthand for `attr("id")`.
    #[must_use]
    pub fn id(&self) -> Value {
        self.attr("id")
    }
}

impl AsRef<str> for ResourceHandle {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// Handle to a declared lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupHandle {
    name: String,
}

impl LookupHandle {
    /// Logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deferred reference to one of the lookup's attributes.
    #[must_use]
    pub fn attr(&self, attribute: &str) -> Value {
        Value::Ref(self.reference(attribute))
    }

    /// The raw reference, for lookups that depend on this one.
    #[must_use]
    pub fn reference(&self, attribute: &str) -> Reference {
        Reference::new(&self.name, attribute)
    }
}

impl AsRef<str> for LookupHandle {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// A named plan-level value.
#[derive(Debug, Clone)]
pub struct Output {
    /// Output name.
    pub name: String,
    /// Value, usually derived from references.
    pub value: Value,
    /// Masked in reports and never persisted.
    pub sensitive: bool,
}

/// What a logical name is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A managed resource.
    Resource(ResourceKind),
    /// A read-only lookup.
    Lookup,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resource(kind) => write!(f, "{kind}"),
            Self::Lookup => write!(f, "lookup"),
        }
    }
}

/// The full set of declarations for one stack.
#[derive(Debug, Clone)]
pub struct Plan {
    provider: ProviderConfig,
    resources: BTreeMap<String, Resource>,
    lookups: BTreeMap<String, LookupQuery>,
    outputs: Vec<Output>,
    dag: Dag,
}

impl Plan {
    /// Creates an empty plan bound to explicit provider settings.
    #[must_use]
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            provider,
            resources: BTreeMap::new(),
            lookups: BTreeMap::new(),
            outputs: Vec::new(),
            dag: Dag::new(),
        }
    }

    /// Declares a resource and records an edge for every reference and
    /// explicit dependency.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` if the name is already bound to any
    /// resource or lookup.
    pub fn declare(&mut self, resource: Resource) -> Result<ResourceHandle, PlanError> {
        self.ensure_unbound(&resource.name)?;

        let name = resource.name.clone();
        self.dag.add_node(name.clone());
        for dependency in resource.dependencies() {
            self.dag.add_edge(dependency, name.clone());
        }
        debug!("Declared {} '{}'", resource.kind, name);

        let handle = ResourceHandle {
            name: name.clone(),
            kind: resource.kind,
        };
        self.resources.insert(name, resource);
        Ok(handle)
    }

    /// Builds a checked reference to an attribute of a declared node.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedReference` for an undeclared target and
    /// `UnknownAttribute` for an attribute the target never exposes.
    pub fn reference(&self, target: impl AsRef<str>, attribute: &str) -> Result<Value, PlanError> {
        let target = target.as_ref();
        let exposed = self.exposed_attributes(target).ok_or_else(|| {
            PlanError::UnresolvedReference {
                from: String::from("<reference>"),
                target: target.to_string(),
            }
        })?;
        if !exposed.contains(&attribute) {
            return Err(self.unknown_attribute("<reference>", target, attribute));
        }
        Ok(Value::Ref(Reference::new(target, attribute)))
    }

    /// Declares a lookup. An identical query returns the existing handle.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` if the name is bound to anything else,
    /// and `InvalidLookup` if the query references a resource.
    pub fn lookup(
        &mut self,
        name: impl Into<String>,
        query: LookupQuery,
    ) -> Result<LookupHandle, PlanError> {
        let name = name.into();

        if let Some((existing, _)) = self.lookups.iter().find(|(_, q)| **q == query) {
            debug!("Lookup '{name}' reuses '{existing}' ({query})");
            return Ok(LookupHandle {
                name: existing.clone(),
            });
        }
        self.ensure_unbound(&name)?;

        for reference in query.references() {
            if self.resources.contains_key(&reference.target) {
                return Err(PlanError::InvalidLookup {
                    lookup: name,
                    target: reference.target,
                });
            }
        }

        self.dag.add_node(name.clone());
        for reference in query.references() {
            self.dag.add_edge(reference.target, name.clone());
        }
        debug!("Declared lookup '{name}' ({query})");

        self.lookups.insert(name.clone(), query);
        Ok(LookupHandle { name })
    }

    /// Orders `resource` strictly after each of `others` without reading
    /// any attribute.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedReference` if the resource is not declared here.
    pub fn depends_on<H: AsRef<str>>(
        &mut self,
        resource: &ResourceHandle,
        others: &[H],
    ) -> Result<(), PlanError> {
        let declared = self.resources.get_mut(resource.name()).ok_or_else(|| {
            PlanError::UnresolvedReference {
                from: String::from("<depends_on>"),
                target: resource.name().to_string(),
            }
        })?;
        for other in others {
            let other = other.as_ref().to_string();
            declared.depends_on.insert(other.clone());
            self.dag.add_edge(other, resource.name().to_string());
        }
        Ok(())
    }

    /// Exports a plan-level output.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateOutput` if the name is already exported.
    pub fn export(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
        sensitive: bool,
    ) -> Result<(), PlanError> {
        let name = name.into();
        if self.outputs.iter().any(|o| o.name == name) {
            return Err(PlanError::DuplicateOutput { name });
        }
        self.outputs.push(Output {
            name,
            value: value.into(),
            sensitive,
        });
        Ok(())
    }

    /// Checks the plan's structure: every reference and dependency resolves
    /// to a declared node exposing the attribute, lookups only depend on
    /// lookups, and the graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns the first structural error found.
    pub fn validate(&self) -> Result<(), PlanError> {
        if let Some((from, target)) = self.dag.dangling().first() {
            return Err(PlanError::UnresolvedReference {
                from: (*from).to_string(),
                target: (*target).to_string(),
            });
        }
        for resource in self.resources.values() {
            for reference in resource.references() {
                self.check_reference(&resource.name, &reference)?;
            }
        }

        for (name, query) in &self.lookups {
            for reference in query.references() {
                if self.resources.contains_key(&reference.target) {
                    return Err(PlanError::InvalidLookup {
                        lookup: name.clone(),
                        target: reference.target,
                    });
                }
                self.check_reference(name, &reference)?;
            }
        }

        for output in &self.outputs {
            for reference in output.value.references() {
                self.check_reference(&output.name, &reference)?;
            }
        }

        if let Some(cycle) = self.dag.find_cycle() {
            return Err(PlanError::CyclicDependency { cycle });
        }
        Ok(())
    }

    /// Validates and returns the full apply order (lookups included).
    ///
    /// # Errors
    ///
    /// Returns any structural error from [`Plan::validate`].
    pub fn apply_order(&self) -> Result<Vec<String>, PlanError> {
        self.validate()?;
        self.dag
            .topological_order()
            .map_err(|cycle| PlanError::CyclicDependency { cycle })
    }

    /// Lookup names in dependency order.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if lookups reference each other in a loop.
    pub fn lookup_order(&self) -> Result<Vec<String>, PlanError> {
        let names: BTreeSet<String> = self.lookups.keys().cloned().collect();
        self.dag
            .subgraph(&names)
            .topological_order()
            .map_err(|cycle| PlanError::CyclicDependency { cycle })
    }

    /// The graph restricted to managed resources.
    #[must_use]
    pub fn resource_graph(&self) -> Dag {
        let names: BTreeSet<String> = self.resources.keys().cloned().collect();
        self.dag.subgraph(&names)
    }

    /// Evaluates every output against resolved attributes.
    ///
    /// # Errors
    ///
    /// Returns the output name and the reference that could not be resolved.
    pub fn evaluate_outputs(
        &self,
        resolved: &HashMap<String, Attributes>,
    ) -> Result<Vec<(&Output, serde_json::Value)>, (String, Reference)> {
        self.outputs
            .iter()
            .map(|o| {
                o.value
                    .resolve(resolved)
                    .map(|v| (o, v))
                    .map_err(|r| (o.name.clone(), r))
            })
            .collect()
    }

    /// What a name is bound to, if anything.
    #[must_use]
    pub fn node_kind(&self, name: &str) -> Option<NodeKind> {
        if let Some(resource) = self.resources.get(name) {
            return Some(NodeKind::Resource(resource.kind));
        }
        self.lookups.get(name).map(|_| NodeKind::Lookup)
    }

    /// Provider settings.
    #[must_use]
    pub const fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Declared resources by name.
    #[must_use]
    pub const fn resources(&self) -> &BTreeMap<String, Resource> {
        &self.resources
    }

    /// Declared lookups by name.
    #[must_use]
    pub const fn lookups(&self) -> &BTreeMap<String, LookupQuery> {
        &self.lookups
    }

    /// Declared outputs in export order.
    #[must_use]
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// The full dependency graph.
    #[must_use]
    pub const fn graph(&self) -> &Dag {
        &self.dag
    }

    /// Fingerprint of the declarations (names, kinds, inputs, edges).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let text = Json::String;
        let provider = Json::Array(vec![
            text(self.provider.project.clone()),
            text(self.provider.environment.clone()),
            text(self.provider.region.clone()),
            Json::Object(
                self.provider
                    .tags
                    .iter()
                    .map(|(k, v)| (k.clone(), text(v.clone())))
                    .collect(),
            ),
        ]);
        let resources = self
            .resources
            .iter()
            .map(|(name, r)| {
                let props = r
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), text(v.to_string())))
                    .collect();
                let depends_on = r.depends_on.iter().cloned().map(text).collect();
                let entry = Json::Array(vec![
                    text(r.kind.to_string()),
                    Json::Object(props),
                    Json::Array(depends_on),
                ]);
                (name.clone(), entry)
            })
            .collect();
        let lookups = self
            .lookups
            .iter()
            .map(|(name, query)| (name.clone(), text(query.to_string())))
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|o| Json::Array(vec![text(o.name.clone()), text(o.value.to_string())]))
            .collect();
        ConfigHasher::new().hash_value(&Json::Array(vec![
            provider,
            Json::Object(resources),
            Json::Object(lookups),
            Json::Array(outputs),
        ]))
    }

    fn ensure_unbound(&self, name: &str) -> Result<(), PlanError> {
        match self.node_kind(name) {
            Some(existing) => Err(PlanError::DuplicateResource {
                name: name.to_string(),
                existing: existing.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn exposed_attributes(&self, name: &str) -> Option<&'static [&'static str]> {
        if let Some(resource) = self.resources.get(name) {
            return Some(resource.kind.attributes());
        }
        self.lookups.get(name).map(LookupQuery::attributes)
    }

    fn check_reference(&self, from: &str, reference: &Reference) -> Result<(), PlanError> {
        let exposed = self.exposed_attributes(&reference.target).ok_or_else(|| {
            PlanError::UnresolvedReference {
                from: from.to_string(),
                target: reference.target.clone(),
            }
        })?;
        if exposed.contains(&reference.attribute.as_str()) {
            Ok(())
        } else {
            Err(self.unknown_attribute(from, &reference.target, &reference.attribute))
        }
    }

    fn unknown_attribute(&self, from: &str, target: &str, attribute: &str) -> PlanError {
        PlanError::UnknownAttribute {
            from: from.to_string(),
            target: target.to_string(),
            kind: self
                .node_kind(target)
                .map(|k| k.to_string())
                .unwrap_or_default(),
            attribute: attribute.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretSource;

    fn plan() -> Plan {
        Plan::new(ProviderConfig::new("taskstack", "dev", "us-east-1"))
    }

    fn position(order: &[String], node: &str) -> usize {
        order
            .iter()
            .position(|n| n == node)
            .unwrap_or_else(|| panic!("{node} missing from {order:?}"))
    }

    #[test]
    fn test_policy_after_bucket() {
        let mut plan = plan();
        let bucket = plan
            .declare(Resource::new("bucketA", ResourceKind::Bucket))
            .unwrap();
        plan.declare(
            Resource::new("policyA", ResourceKind::BucketPolicy).with("bucket", bucket.id()),
        )
        .unwrap();

        assert_eq!(plan.apply_order().unwrap(), vec!["bucketA", "policyA"]);
    }

    #[test]
    fn test_instance_after_both_groups_regardless_of_declaration_order() {
        let declare = |first: &str, second: &str| {
            let mut plan = plan();
            plan.declare(Resource::new(first, ResourceKind::SecurityGroup))
                .unwrap();
            plan.declare(Resource::new(second, ResourceKind::SecurityGroup))
                .unwrap();
            plan.declare(Resource::new("instanceA", ResourceKind::Instance).with(
                "security_group_ids",
                Value::List(vec![
                    Reference::new("sgA", "id").into(),
                    Reference::new("sgB", "id").into(),
                ]),
            ))
            .unwrap();
            plan.apply_order().unwrap()
        };

        let a = declare("sgA", "sgB");
        let b = declare("sgB", "sgA");
        assert_eq!(a, vec!["sgA", "sgB", "instanceA"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_names_fail_across_kinds() {
        let mut plan = plan();
        plan.declare(Resource::new("site", ResourceKind::Bucket))
            .unwrap();

        let err = plan
            .declare(Resource::new("site", ResourceKind::SecurityGroup))
            .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateResource { ref name, .. } if name == "site"));

        let err = plan.lookup("site", LookupQuery::DefaultVpc).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateResource { .. }));

        let mut plan = self::plan();
        plan.lookup("vpc", LookupQuery::DefaultVpc).unwrap();
        let err = plan
            .declare(Resource::new("vpc", ResourceKind::Bucket))
            .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateResource { ref existing, .. } if existing == "lookup"));
    }

    #[test]
    fn test_two_cycle_detected() {
        let mut plan = plan();
        plan.declare(
            Resource::new("a", ResourceKind::SecurityGroup).with("peer", Reference::new("b", "id")),
        )
        .unwrap();
        plan.declare(
            Resource::new("b", ResourceKind::SecurityGroup).with("peer", Reference::new("a", "id")),
        )
        .unwrap();

        let err = plan.apply_order().unwrap_err();
        assert!(matches!(err, PlanError::CyclicDependency { ref cycle } if cycle.len() == 3));
    }

    #[test]
    fn test_three_cycle_through_depends_on() {
        let mut plan = plan();
        let a = plan
            .declare(Resource::new("a", ResourceKind::IamRole).after("c"))
            .unwrap();
        plan.declare(Resource::new("b", ResourceKind::IamRole).with("x", a.id()))
            .unwrap();
        plan.declare(
            Resource::new("c", ResourceKind::IamRole).with("x", Reference::new("b", "arn")),
        )
        .unwrap();

        match plan.validate().unwrap_err() {
            PlanError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unresolved_reference() {
        let mut plan = plan();
        plan.declare(
            Resource::new("policy", ResourceKind::BucketPolicy)
                .with("bucket", Reference::new("ghost", "id")),
        )
        .unwrap();

        let err = plan.validate().unwrap_err();
        assert!(matches!(
            err,
            PlanError::UnresolvedReference { ref from, ref target } if from == "policy" && target == "ghost"
        ));
    }

    #[test]
    fn test_unknown_attribute() {
        let mut plan = plan();
        let bucket = plan
            .declare(Resource::new("site", ResourceKind::Bucket))
            .unwrap();
        plan.export("ip", bucket.attr("public_ip"), false).unwrap();

        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::UnknownAttribute { ref attribute, .. } if attribute == "public_ip"
        ));
        assert!(plan.reference(&bucket, "arn").is_ok());
        assert!(plan.reference(&bucket, "public_ip").is_err());
        assert!(plan.reference("nope", "id").is_err());
    }

    #[test]
    fn test_depends_on_orders_without_references() {
        let mut plan = plan();
        // Names chosen so that name order alone would put the policy first.
        let bap = plan
            .declare(Resource::new("z-bap", ResourceKind::BucketPublicAccessBlock))
            .unwrap();
        let policy = plan
            .declare(Resource::new("a-policy", ResourceKind::BucketPolicy))
            .unwrap();
        plan.depends_on(&policy, &[&bap]).unwrap();

        let order = plan.apply_order().unwrap();
        assert!(position(&order, "z-bap") < position(&order, "a-policy"));
        assert!(plan.resources()["a-policy"].depends_on.contains("z-bap"));
    }

    #[test]
    fn test_subnet_group_after_subnet_lookup() {
        let mut plan = plan();
        let vpc = plan.lookup("vpc", LookupQuery::DefaultVpc).unwrap();
        let subnets = plan
            .lookup(
                "subnets",
                LookupQuery::Subnets {
                    vpc: vpc.reference("id"),
                },
            )
            .unwrap();
        plan.declare(
            Resource::new("dbSubnetGroup", ResourceKind::DbSubnetGroup)
                .with("subnet_ids", subnets.attr("ids")),
        )
        .unwrap();

        let order = plan.apply_order().unwrap();
        assert!(position(&order, "vpc") < position(&order, "subnets"));
        assert!(position(&order, "subnets") < position(&order, "dbSubnetGroup"));
        assert_eq!(plan.lookup_order().unwrap(), vec!["vpc", "subnets"]);
    }

    #[test]
    fn test_identical_lookups_are_cached() {
        let mut plan = plan();
        let first = plan.lookup("vpc", LookupQuery::DefaultVpc).unwrap();
        let second = plan.lookup("default-vpc", LookupQuery::DefaultVpc).unwrap();

        assert_eq!(first, second);
        assert_eq!(plan.lookups().len(), 1);
    }

    #[test]
    fn test_lookup_cannot_reference_resource() {
        let mut plan = plan();
        plan.declare(Resource::new("site", ResourceKind::Bucket))
            .unwrap();
        let err = plan
            .lookup(
                "subnets",
                LookupQuery::Subnets {
                    vpc: Reference::new("site", "id"),
                },
            )
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidLookup { .. }));
    }

    #[test]
    fn test_duplicate_output() {
        let mut plan = plan();
        plan.export("bucket", Value::from("x"), false).unwrap();
        assert!(matches!(
            plan.export("bucket", Value::from("y"), false),
            Err(PlanError::DuplicateOutput { .. })
        ));
    }

    #[test]
    fn test_physical_names() {
        let provider = ProviderConfig::new("taskstack", "dev", "us-east-1");
        assert_eq!(
            provider.physical_name("api-sg", ResourceKind::SecurityGroup),
            "taskstack-dev-api-sg"
        );

        let bucket = provider.physical_name("site", ResourceKind::Bucket);
        assert!(bucket.starts_with("taskstack-dev-site-"));
        assert_eq!(bucket.len(), "taskstack-dev-site-".len() + 8);
        assert_eq!(bucket, provider.physical_name("site", ResourceKind::Bucket));

        let other_region = ProviderConfig::new("taskstack", "dev", "eu-west-1");
        assert_ne!(bucket, other_region.physical_name("site", ResourceKind::Bucket));
    }

    #[test]
    fn test_fingerprint_tracks_inputs() {
        let build = |port: u16| {
            let mut plan = plan();
            plan.declare(Resource::new("sg", ResourceKind::SecurityGroup).with("port", port))
                .unwrap();
            plan.lookup(
                "secret",
                LookupQuery::Secret {
                    source: SecretSource::Env("DB_PASSWORD".into()),
                },
            )
            .unwrap();
            plan.fingerprint()
        };
        assert_eq!(build(80), build(80));
        assert_ne!(build(80), build(8080));
    }

    #[test]
    fn test_fingerprint_covers_lookups_and_provider() {
        let build = |var: &str, region: &str| {
            let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", region));
            plan.lookup(
                "secret",
                LookupQuery::Secret {
                    source: SecretSource::Env(var.into()),
                },
            )
            .unwrap();
            plan.fingerprint()
        };
        let empty = ConfigHasher::new().hash_str("");

        assert_ne!(build("A", "us-east-1"), empty);
        assert_ne!(build("A", "us-east-1"), build("B", "us-east-1"));
        assert_ne!(build("A", "us-east-1"), build("A", "eu-west-1"));
    }
}
