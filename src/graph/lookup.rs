//! Read-only queries against existing cloud state.
//!
//! Lookups are never created or destroyed. They resolve before any resource
//! is touched and may only depend on other lookups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::value::Reference;
use crate::config::SecretSource;

/// A query for pre-existing cloud state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum LookupQuery {
    /// The account's default VPC in the provider region.
    DefaultVpc,
    /// Subnets of a VPC; `vpc` must reference another lookup's `id`.
    Subnets {
        /// Reference to the VPC id.
        vpc: Reference,
    },
    /// Most recent machine image matching a name pattern.
    LatestAmi {
        /// Owner account ids.
        owners: Vec<String>,
        /// Name glob.
        name_pattern: String,
    },
    /// The provider region.
    Region,
    /// A secret value; never logged or written to state.
    Secret {
        /// Where the secret lives.
        source: SecretSource,
    },
}

impl LookupQuery {
    /// Attributes exposed once resolved.
    #[must_use]
    pub const fn attributes(&self) -> &'static [&'static str] {
        match self {
            Self::DefaultVpc => &["id", "cidr_block"],
            Self::Subnets { .. } => &["id", "ids"],
            Self::LatestAmi { .. } => &["id", "name"],
            Self::Region => &["id", "name"],
            Self::Secret { .. } => &["id", "value", "version"],
        }
    }

    /// References to other lookups.
    #[must_use]
    pub fn references(&self) -> BTreeSet<Reference> {
        match self {
            Self::Subnets { vpc } => BTreeSet::from([vpc.clone()]),
            _ => BTreeSet::new(),
        }
    }

    /// True if the result must never be displayed or persisted.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(self, Self::Secret { .. })
    }

    /// Short label for previews and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::DefaultVpc => "default_vpc",
            Self::Subnets { .. } => "subnets",
            Self::LatestAmi { .. } => "latest_ami",
            Self::Region => "region",
            Self::Secret { .. } => "secret",
        }
    }
}

impl fmt::Display for LookupQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultVpc => write!(f, "default VPC"),
            Self::Subnets { vpc } => write!(f, "subnets of ${{{vpc}}}"),
            Self::LatestAmi {
                owners,
                name_pattern,
            } => write!(f, "latest AMI '{name_pattern}' owned by {}", owners.join(",")),
            Self::Region => write!(f, "provider region"),
            Self::Secret { source } => write!(f, "secret {}", source.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnets_reference_vpc() {
        let query = LookupQuery::Subnets {
            vpc: Reference::new("vpc", "id"),
        };
        assert_eq!(query.references().len(), 1);
        assert!(LookupQuery::DefaultVpc.references().is_empty());
    }

    #[test]
    fn test_secret_display_hides_value() {
        let query = LookupQuery::Secret {
            source: SecretSource::SsmParameter("/taskstack/dev/db".into()),
        };
        assert!(query.is_sensitive());
        assert_eq!(query.to_string(), "secret ssm:/taskstack/dev/db");
    }
}
