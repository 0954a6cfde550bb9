//! Deferred input values.
//!
//! A resource input is either known at declaration time or depends on an
//! attribute another node exposes once it has been created or looked up.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Attributes exposed by a created resource or a completed lookup.
pub type Attributes = BTreeMap<String, Json>;

/// A pointer to one attribute of another declared node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Logical name of the producing node.
    pub target: String,
    /// Attribute read from the producer.
    pub attribute: String,
}

impl Reference {
    /// Creates a reference to `target.attribute`.
    #[must_use]
    pub fn new(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: attribute.into(),
        }
    }

    /// Reads the referenced attribute from a resolved set.
    #[must_use]
    pub fn read<'a>(&self, resolved: &'a HashMap<String, Attributes>) -> Option<&'a Json> {
        resolved.get(&self.target)?.get(&self.attribute)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// Pure transformation applied to resolved inputs.
pub type DeriveFn = Arc<dyn Fn(&[Json]) -> Json + Send + Sync>;

/// A value computed from other values once they are all resolved.
#[derive(Clone)]
pub struct Derived {
    /// Inputs, resolved before `func` runs.
    pub inputs: Vec<Value>,
    /// Human-readable label used in previews.
    pub label: String,
    func: DeriveFn,
}

impl Derived {
    /// Evaluates the transformation over already-resolved inputs.
    #[must_use]
    pub fn evaluate(&self, inputs: &[Json]) -> Json {
        (self.func)(inputs)
    }
}

impl fmt::Debug for Derived {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("label", &self.label)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

/// An input value, possibly deferred until apply.
#[derive(Debug, Clone)]
pub enum Value {
    /// Known at declaration time.
    Literal(Json),
    /// Read from another node after it completes.
    Ref(Reference),
    /// Ordered list of values.
    List(Vec<Value>),
    /// String-keyed map of values.
    Map(BTreeMap<String, Value>),
    /// Computed from other values.
    Derived(Derived),
}

impl Value {
    /// Creates a derived value.
    pub fn derive<F>(label: impl Into<String>, inputs: Vec<Self>, func: F) -> Self
    where
        F: Fn(&[Json]) -> Json + Send + Sync + 'static,
    {
        Self::Derived(Derived {
            inputs,
            label: label.into(),
            func: Arc::new(func),
        })
    }

    /// Composes a string from a template where each `{}` is replaced by the
    /// next input. Strings are inserted without quotes.
    pub fn interpolate(template: impl Into<String>, inputs: Vec<Self>) -> Self {
        let template = template.into();
        let label = template.clone();
        Self::derive(label, inputs, move |values| {
            let mut out = String::with_capacity(template.len());
            let mut values = values.iter();
            let mut rest = template.as_str();
            while let Some(pos) = rest.find("{}") {
                out.push_str(&rest[..pos]);
                match values.next() {
                    Some(v) => out.push_str(&plain_string(v)),
                    None => out.push_str("{}"),
                }
                rest = &rest[pos + 2..];
            }
            out.push_str(rest);
            Json::String(out)
        })
    }

    /// Every reference this value reads, including nested ones.
    #[must_use]
    pub fn references(&self) -> BTreeSet<Reference> {
        let mut refs = BTreeSet::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references(&self, refs: &mut BTreeSet<Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(r) => {
                refs.insert(r.clone());
            }
            Self::List(items) => items.iter().for_each(|v| v.collect_references(refs)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(refs)),
            Self::Derived(d) => d.inputs.iter().for_each(|v| v.collect_references(refs)),
        }
    }

    /// Resolves the value against completed nodes.
    ///
    /// # Errors
    ///
    /// Returns the first reference that has no resolved value.
    pub fn resolve(&self, resolved: &HashMap<String, Attributes>) -> Result<Json, Reference> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Ref(r) => r.read(resolved).cloned().ok_or_else(|| r.clone()),
            Self::List(items) => items
                .iter()
                .map(|v| v.resolve(resolved))
                .collect::<Result<Vec<_>, _>>()
                .map(Json::Array),
            Self::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.resolve(resolved)?);
                }
                Ok(Json::Object(map))
            }
            Self::Derived(d) => {
                let inputs = d
                    .inputs
                    .iter()
                    .map(|v| v.resolve(resolved))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(d.evaluate(&inputs))
            }
        }
    }
}

/// Renders a JSON value as a bare string (no quotes around strings).
#[must_use]
pub fn plain_string(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolves a whole property map into a JSON object.
///
/// # Errors
///
/// Returns the first unresolved reference.
pub fn resolve_properties(
    properties: &BTreeMap<String, Value>,
    resolved: &HashMap<String, Attributes>,
) -> Result<Attributes, Reference> {
    properties
        .iter()
        .map(|(k, v)| v.resolve(resolved).map(|json| (k.clone(), json)))
        .collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Ref(r) => write!(f, "${{{r}}}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                write!(f, "}}")
            }
            Self::Derived(d) => {
                write!(f, "{}(", d.label)?;
                for (i, input) in d.inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{input}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<Json> for Value {
    fn from(value: Json) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Literal(Json::String(value.to_string()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Literal(Json::String(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Literal(Json::Bool(value))
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Self::Literal(Json::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Literal(Json::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Literal(Json::from(value))
    }
}

impl From<Reference> for Value {
    fn from(value: Reference) -> Self {
        Self::Ref(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolved() -> HashMap<String, Attributes> {
        let mut site = Attributes::new();
        site.insert("id".into(), json!("taskstack-dev-site-1a2b3c4d"));
        let mut region = Attributes::new();
        region.insert("name".into(), json!("eu-west-1"));
        HashMap::from([("site".to_string(), site), ("region".to_string(), region)])
    }

    #[test]
    fn test_interpolate_website_url() {
        let url = Value::interpolate(
            "http://{}.s3-website-{}.amazonaws.com",
            vec![
                Reference::new("site", "id").into(),
                Reference::new("region", "name").into(),
            ],
        );

        assert_eq!(url.references().len(), 2);
        assert_eq!(
            url.resolve(&resolved()).unwrap(),
            json!("http://taskstack-dev-site-1a2b3c4d.s3-website-eu-west-1.amazonaws.com")
        );
    }

    #[test]
    fn test_unresolved_reference_is_reported() {
        let value = Value::List(vec![
            Value::from("literal"),
            Reference::new("api", "public_ip").into(),
        ]);

        let missing = value.resolve(&resolved()).unwrap_err();
        assert_eq!(missing, Reference::new("api", "public_ip"));
    }

    #[test]
    fn test_nested_map_resolution() {
        let mut statement = BTreeMap::new();
        statement.insert("Effect".to_string(), Value::from("Allow"));
        statement.insert(
            "Resource".to_string(),
            Value::interpolate("arn:aws:s3:::{}/*", vec![Reference::new("site", "id").into()]),
        );
        let value = Value::Map(statement);

        assert_eq!(value.references().len(), 1);
        assert_eq!(
            value.resolve(&resolved()).unwrap(),
            json!({
                "Effect": "Allow",
                "Resource": "arn:aws:s3:::taskstack-dev-site-1a2b3c4d/*"
            })
        );
    }

    #[test]
    fn test_display_shows_deferred_parts() {
        let value = Value::interpolate("{}:5432", vec![Reference::new("db", "address").into()]);
        assert_eq!(value.to_string(), "{}:5432(${db.address})");
    }
}
