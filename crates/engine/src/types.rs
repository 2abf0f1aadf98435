//! Core types for the engine: specs, objects, plugin names and groups.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Kind under which group specs are stored.
pub const GROUP_KIND: &str = "group";

/// Identifying metadata of a spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    /// Object name, unique within a kind.
    pub name: String,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Metadata {
    /// Metadata with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Whether this metadata satisfies a search filter.
    ///
    /// An empty search name matches any name; every search tag must be
    /// present with the same value.
    pub fn matches(&self, search: &Self) -> bool {
        (search.name.is_empty() || search.name == self.name)
            && search
                .tags
                .iter()
                .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}

/// A declared dependency of a spec on another managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: String,
    pub name: String,
}

/// Desired-state document for one managed object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub kind: String,
    #[serde(default)]
    pub version: String,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<Dependency>,
}

impl Spec {
    /// Create a spec with a kind and a name.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            metadata: Metadata::named(name),
            ..Self::default()
        }
    }

    /// Set the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the opaque properties.
    #[must_use]
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Set the opaque options.
    #[must_use]
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Add a tag to the metadata.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata = self.metadata.with_tag(key, value);
        self
    }

    /// Declare a dependency.
    #[must_use]
    pub fn depends_on(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.depends.push(Dependency {
            kind: kind.into(),
            name: name.into(),
        });
        self
    }

    /// Reject specs that cannot be keyed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` when the kind or the name is empty.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(Error::invalid_spec("kind is empty"));
        }
        if self.metadata.name.is_empty() {
            return Err(Error::invalid_spec(format!(
                "{} spec has no name",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Name and version of a capability contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    pub version: String,
}

impl InterfaceSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// The Controller contract.
    pub fn controller() -> Self {
        Self::new("Controller", "0.1.0")
    }

    /// The Group contract.
    pub fn group() -> Self {
        Self::new("Group", "0.1.0")
    }
}

impl fmt::Display for InterfaceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Reference to a plugin: `lookup` or `lookup/type`.
///
/// The lookup part is what discovery indexes endpoints by; the optional
/// type part addresses one of several objects served by the same endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginName(String);

impl PluginName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The discovery lookup part.
    pub fn lookup(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(lookup, _)| lookup)
    }

    /// The type part, if any.
    pub fn type_name(&self) -> Option<&str> {
        self.0
            .split_once('/')
            .map(|(_, kind)| kind)
            .filter(|kind| !kind.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Equal names, or equal lookups when either side leaves the type open.
    pub fn matches(&self, other: &Self) -> bool {
        self == other
            || ((self.type_name().is_none() || other.type_name().is_none())
                && self.lookup() == other.lookup())
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PluginName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Observed counterpart of a spec, as reported by a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub spec: Spec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl Object {
    pub fn new(spec: Spec) -> Self {
        Self { spec, state: None }
    }
}

/// What a commit would do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub message: Vec<String>,
}

impl Plan {
    pub fn message(line: impl Into<String>) -> Self {
        Self {
            message: vec![line.into()],
        }
    }
}

/// Commit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Make the object match its spec.
    Enforce,
    /// Tear the object down.
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enforce => f.write_str("enforce"),
            Self::Destroy => f.write_str("destroy"),
        }
    }
}

/// Identifier of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Desired state of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl GroupSpec {
    pub fn new(id: impl Into<GroupId>, properties: Option<Value>) -> Self {
        Self {
            id: id.into(),
            properties,
        }
    }

    /// The generic spec shape a group is stored under.
    pub fn to_spec(&self) -> Spec {
        Spec {
            kind: GROUP_KIND.to_string(),
            metadata: Metadata::named(self.id.as_str()),
            properties: self.properties.clone(),
            ..Spec::default()
        }
    }
}

impl TryFrom<&Spec> for GroupSpec {
    type Error = Error;

    fn try_from(spec: &Spec) -> Result<Self> {
        if spec.kind != GROUP_KIND {
            return Err(Error::invalid_spec(format!(
                "expected kind '{GROUP_KIND}', got '{}'",
                spec.kind
            )));
        }
        Ok(Self {
            id: GroupId::new(spec.metadata.name.clone()),
            properties: spec.properties.clone(),
        })
    }
}

/// Observed state of one group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Observed state of a group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupDescription {
    pub instances: Vec<Instance>,
    pub converged: bool,
}
