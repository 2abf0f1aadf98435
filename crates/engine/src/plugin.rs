//! Plugin capabilities and the connector that opens them.
//!
//! A discovered endpoint may implement either capability, both, or
//! neither. [`Connector::connect`] is asked for one capability at a time
//! and answers `Ok(None)` when the endpoint does not implement it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::discovery::Endpoint;
use crate::error::{Error, Result};
use crate::types::{
    GroupDescription, GroupId, GroupSpec, InterfaceSpec, Metadata, Object, Operation, Plan, Spec,
};

/// Generic object controller.
#[async_trait]
pub trait Controller: Send + Sync {
    /// What `commit` would do.
    async fn plan(&self, operation: Operation, spec: &Spec) -> Result<(Object, Plan)>;

    /// Apply `operation` to the object described by `spec`.
    async fn commit(&self, operation: Operation, spec: &Spec) -> Result<Object>;

    /// Observed objects matching `search`, or all when `None`.
    async fn describe(&self, search: Option<&Metadata>) -> Result<Vec<Object>>;

    /// Desired specs matching `search`, or all when `None`.
    async fn specs(&self, search: Option<&Metadata>) -> Result<Vec<Spec>>;

    /// Stop managing the matching objects without tearing them down.
    async fn pause(&self, search: Option<&Metadata>) -> Result<Vec<Object>>;

    /// Tear down the matching objects.
    async fn terminate(&self, search: Option<&Metadata>) -> Result<Vec<Object>>;
}

/// Manager of named groups.
#[async_trait]
pub trait GroupPlugin: Send + Sync {
    /// Converge a group toward `spec`. With `pretend`, only describe the change.
    async fn commit_group(&self, spec: &GroupSpec, pretend: bool) -> Result<String>;

    async fn inspect_groups(&self) -> Result<Vec<GroupSpec>>;

    async fn describe_group(&self, id: &GroupId) -> Result<GroupDescription>;

    /// Destroy the group and its members.
    async fn destroy_group(&self, id: &GroupId) -> Result<()>;

    /// Stop managing the group, leaving its members running.
    async fn free_group(&self, id: &GroupId) -> Result<()>;

    async fn size(&self, id: &GroupId) -> Result<usize>;

    async fn set_size(&self, id: &GroupId, size: usize) -> Result<()>;
}

/// The capabilities a plugin can be visited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Controller,
    Group,
}

impl Capability {
    pub fn interface(self) -> InterfaceSpec {
        match self {
            Self::Controller => InterfaceSpec::controller(),
            Self::Group => InterfaceSpec::group(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interface())
    }
}

/// A connected plugin, tagged by capability.
#[derive(Clone)]
pub enum Adapter {
    Controller(Arc<dyn Controller>),
    Group(Arc<dyn GroupPlugin>),
}

impl Adapter {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Controller(_) => Capability::Controller,
            Self::Group(_) => Capability::Group,
        }
    }

    pub fn into_controller(self) -> Option<Arc<dyn Controller>> {
        match self {
            Self::Controller(controller) => Some(controller),
            Self::Group(_) => None,
        }
    }

    pub fn into_group(self) -> Option<Arc<dyn GroupPlugin>> {
        match self {
            Self::Group(group) => Some(group),
            Self::Controller(_) => None,
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Adapter").field(&self.capability()).finish()
    }
}

/// Opens a client for one capability of an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// `Ok(None)` when the endpoint does not implement `capability`.
    ///
    /// # Errors
    ///
    /// Returns `Connect` when the endpoint cannot be reached.
    async fn connect(&self, endpoint: &Endpoint, capability: Capability)
    -> Result<Option<Adapter>>;
}

/// Connector over plugins living in this process, keyed by endpoint name.
#[derive(Default)]
pub struct LocalConnector {
    controllers: RwLock<HashMap<String, Arc<dyn Controller>>>,
    groups: RwLock<HashMap<String, Arc<dyn GroupPlugin>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_controller(&self, lookup: impl Into<String>, controller: Arc<dyn Controller>) {
        self.controllers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(lookup.into(), controller);
    }

    pub fn register_group(&self, lookup: impl Into<String>, group: Arc<dyn GroupPlugin>) {
        self.groups
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(lookup.into(), group);
    }

    fn knows(&self, lookup: &str) -> bool {
        self.controllers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(lookup)
            || self
                .groups
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .contains_key(lookup)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        capability: Capability,
    ) -> Result<Option<Adapter>> {
        if !self.knows(&endpoint.name) {
            return Err(Error::connect(&endpoint.name, "no local plugin registered"));
        }

        let adapter = match capability {
            Capability::Controller => self
                .controllers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&endpoint.name)
                .cloned()
                .map(Adapter::Controller),
            Capability::Group => self
                .groups
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&endpoint.name)
                .cloned()
                .map(Adapter::Group),
        };
        Ok(adapter)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl GroupPlugin for Idle {
        async fn commit_group(&self, spec: &GroupSpec, _pretend: bool) -> Result<String> {
            Ok(format!("committed {}", spec.id))
        }
        async fn inspect_groups(&self) -> Result<Vec<GroupSpec>> {
            Ok(Vec::new())
        }
        async fn describe_group(&self, _id: &GroupId) -> Result<GroupDescription> {
            Ok(GroupDescription::default())
        }
        async fn destroy_group(&self, _id: &GroupId) -> Result<()> {
            Ok(())
        }
        async fn free_group(&self, _id: &GroupId) -> Result<()> {
            Ok(())
        }
        async fn size(&self, _id: &GroupId) -> Result<usize> {
            Ok(0)
        }
        async fn set_size(&self, _id: &GroupId, _size: usize) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn local_connector_discriminates_capabilities() {
        let connector = LocalConnector::new();
        connector.register_group("group", Arc::new(Idle));
        let endpoint = Endpoint::new("group", "local", "group");

        let group = connector.connect(&endpoint, Capability::Group).await.unwrap();
        assert_eq!(group.map(|a| a.capability()), Some(Capability::Group));

        let controller = connector
            .connect(&endpoint, Capability::Controller)
            .await
            .unwrap();
        assert!(controller.is_none());
    }

    #[tokio::test]
    async fn local_connector_rejects_unknown_endpoint() {
        let connector = LocalConnector::new();
        let endpoint = Endpoint::new("ghost", "local", "ghost");
        let result = connector.connect(&endpoint, Capability::Group).await;
        assert!(matches!(result, Err(Error::Connect { .. })));
    }

    #[test]
    fn capability_interfaces() {
        assert_eq!(Capability::Controller.interface(), InterfaceSpec::controller());
        assert_eq!(Capability::Group.to_string(), "Group/0.1.0");
    }
}
