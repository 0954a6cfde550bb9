//! Typed cloud resource declarations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::value::{Reference, Value};

/// The kinds of cloud resource the planner can manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// S3 bucket.
    Bucket,
    /// Bucket-level public access block settings.
    BucketPublicAccessBlock,
    /// Static website hosting configuration.
    BucketWebsite,
    /// Bucket CORS rules.
    BucketCors,
    /// Bucket policy document.
    BucketPolicy,
    /// Uploaded static frontend files.
    BucketContent,
    /// VPC security group with its rules.
    SecurityGroup,
    /// IAM role.
    IamRole,
    /// Managed policy attached to a role.
    RolePolicyAttachment,
    /// Instance profile wrapping a role.
    InstanceProfile,
    /// EC2 instance.
    Instance,
    /// RDS subnet group.
    DbSubnetGroup,
    /// RDS database instance.
    DbInstance,
}

/// How a resource converges when its inputs change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// The backend can modify the existing resource.
    InPlace,
    /// The resource is deleted and created again.
    Replace,
}

impl ResourceKind {
    /// All kinds, in a stable order.
    pub const ALL: [Self; 13] = [
        Self::Bucket,
        Self::BucketPublicAccessBlock,
        Self::BucketWebsite,
        Self::BucketCors,
        Self::BucketPolicy,
        Self::BucketContent,
        Self::SecurityGroup,
        Self::IamRole,
        Self::RolePolicyAttachment,
        Self::InstanceProfile,
        Self::Instance,
        Self::DbSubnetGroup,
        Self::DbInstance,
    ];

    /// Attributes every backend exposes for this kind after creation.
    #[must_use]
    pub const fn attributes(self) -> &'static [&'static str] {
        match self {
            Self::Bucket => &["id", "arn", "bucket_domain_name", "region"],
            Self::BucketPublicAccessBlock | Self::BucketCors | Self::BucketPolicy => {
                &["id", "bucket"]
            }
            Self::BucketWebsite => &["id", "bucket", "website_endpoint"],
            Self::BucketContent => &["id", "bucket", "digest", "object_count"],
            Self::SecurityGroup => &["id", "name", "vpc_id"],
            Self::IamRole | Self::InstanceProfile => &["id", "arn", "name"],
            Self::RolePolicyAttachment => &["id", "role", "policy_arn"],
            Self::Instance => &["id", "public_ip", "public_dns", "private_ip"],
            Self::DbSubnetGroup => &["id", "arn", "name"],
            Self::DbInstance => &["id", "arn", "address", "port", "endpoint"],
        }
    }

    /// Returns true if the kind exposes the attribute.
    #[must_use]
    pub fn has_attribute(self, attribute: &str) -> bool {
        self.attributes().contains(&attribute)
    }

    /// How changed inputs are converged.
    #[must_use]
    pub const fn update_strategy(self) -> UpdateStrategy {
        match self {
            Self::RolePolicyAttachment | Self::InstanceProfile | Self::Instance => {
                UpdateStrategy::Replace
            }
            _ => UpdateStrategy::InPlace,
        }
    }

    /// Inputs the backend cannot modify on an existing resource. A change to
    /// any of them replaces the resource even when the kind updates in place.
    #[must_use]
    pub const fn immutable_inputs(self) -> &'static [&'static str] {
        match self {
            Self::BucketPublicAccessBlock
            | Self::BucketWebsite
            | Self::BucketCors
            | Self::BucketPolicy
            | Self::BucketContent => &["bucket"],
            Self::SecurityGroup => &["vpc_id", "description"],
            Self::DbInstance => &["engine", "db_name", "username"],
            _ => &[],
        }
    }

    /// True for kinds whose physical names are globally unique.
    #[must_use]
    pub const fn is_globally_named(self) -> bool {
        matches!(self, Self::Bucket)
    }

    /// Snake-case type name used in state and previews.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::Bucket => "bucket",
            Self::BucketPublicAccessBlock => "bucket_public_access_block",
            Self::BucketWebsite => "bucket_website",
            Self::BucketCors => "bucket_cors",
            Self::BucketPolicy => "bucket_policy",
            Self::BucketContent => "bucket_content",
            Self::SecurityGroup => "security_group",
            Self::IamRole => "iam_role",
            Self::RolePolicyAttachment => "role_policy_attachment",
            Self::InstanceProfile => "instance_profile",
            Self::Instance => "instance",
            Self::DbSubnetGroup => "db_subnet_group",
            Self::DbInstance => "db_instance",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InPlace => write!(f, "in-place"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

/// A declared resource: logical name, kind, inputs and explicit ordering.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Logical name, unique within a plan.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Input properties, possibly referencing other nodes.
    pub properties: BTreeMap<String, Value>,
    /// Nodes that must complete first without any attribute being read.
    pub depends_on: BTreeSet<String>,
}

impl Resource {
    /// Starts a resource declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            properties: BTreeMap::new(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Sets an input property.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency on another node.
    #[must_use]
    pub fn after(mut self, node: impl AsRef<str>) -> Self {
        self.depends_on.insert(node.as_ref().to_string());
        self
    }

    /// Every reference read by the properties.
    #[must_use]
    pub fn references(&self) -> BTreeSet<Reference> {
        self.properties
            .values()
            .flat_map(Value::references)
            .collect()
    }

    /// Every node this resource waits for: referenced targets plus explicit
    /// dependencies.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.references()
            .into_iter()
            .map(|r| r.target)
            .chain(self.depends_on.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_exposes_id() {
        for kind in ResourceKind::ALL {
            assert!(kind.has_attribute("id"), "{kind} has no id");
        }
    }

    #[test]
    fn test_dependencies_merge_refs_and_explicit() {
        let policy = Resource::new("site-policy", ResourceKind::BucketPolicy)
            .with("bucket", Reference::new("site", "id"))
            .after("site-bap");

        let deps: Vec<String> = policy.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["site".to_string(), "site-bap".to_string()]);
    }

    #[test]
    fn test_replace_only_where_backend_cannot_modify() {
        assert_eq!(ResourceKind::Instance.update_strategy(), UpdateStrategy::Replace);
        assert_eq!(ResourceKind::DbInstance.update_strategy(), UpdateStrategy::InPlace);
        assert_eq!(ResourceKind::Bucket.update_strategy(), UpdateStrategy::InPlace);
        assert!(ResourceKind::DbInstance.immutable_inputs().contains(&"engine"));
        assert!(ResourceKind::SecurityGroup.immutable_inputs().contains(&"vpc_id"));
        assert!(!ResourceKind::DbInstance.immutable_inputs().contains(&"engine_version"));
    }

    #[test]
    fn test_type_names_match_serde() {
        for kind in ResourceKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::json!(kind.type_name()));
        }
    }
}
