//! Plugin discovery.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::PluginName;

/// Where and how to reach a discovered plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub protocol: String,
    pub address: String,
}

impl Endpoint {
    pub fn new(
        name: impl Into<String>,
        protocol: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            address: address.into(),
        }
    }
}

/// Eventually consistent view of the plugins currently reachable.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// All endpoints, keyed by lookup name.
    ///
    /// # Errors
    ///
    /// Returns an error when the listing itself fails.
    async fn list(&self) -> Result<BTreeMap<String, Endpoint>>;

    /// The endpoint serving `name`'s lookup.
    ///
    /// # Errors
    ///
    /// Returns `PluginNotFound` when no endpoint is listed under the lookup.
    async fn find(&self, name: &PluginName) -> Result<Endpoint> {
        self.list()
            .await?
            .remove(name.lookup())
            .ok_or_else(|| Error::plugin_not_found(name.as_str()))
    }
}

/// Discovery over an explicitly maintained table.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    endpoints: RwLock<BTreeMap<String, Endpoint>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an endpoint under its name.
    pub fn register(&self, endpoint: Endpoint) {
        self.endpoints
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(endpoint.name.clone(), endpoint);
    }

    /// Register a local endpoint by lookup name alone.
    pub fn register_local(&self, lookup: &str) {
        self.register(Endpoint::new(lookup, "local", lookup));
    }

    pub fn remove(&self, lookup: &str) -> Option<Endpoint> {
        self.endpoints
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(lookup)
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn list(&self) -> Result<BTreeMap<String, Endpoint>> {
        Ok(self
            .endpoints
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}

/// Discovery over a directory of plugin sockets.
///
/// Every entry in the directory is one endpoint; its file name is the
/// lookup name and its path the address.
#[derive(Debug, Clone)]
pub struct DirectoryDiscovery {
    dir: PathBuf,
}

impl DirectoryDiscovery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Discovery for DirectoryDiscovery {
    async fn list(&self) -> Result<BTreeMap<String, Endpoint>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(steward_core::Error::file_read_failed(&self.dir, e.to_string()).into());
            }
        };

        let mut endpoints = BTreeMap::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| steward_core::Error::file_read_failed(&self.dir, e.to_string()))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let address = entry.path().display().to_string();
            endpoints.insert(name.clone(), Endpoint::new(name, "unix", address));
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_find_uses_lookup_part() {
        let discovery = StaticDiscovery::new();
        discovery.register_local("instance-aws");

        let found = discovery
            .find(&PluginName::from("instance-aws/ec2-instance"))
            .await
            .unwrap();
        assert_eq!(found.name, "instance-aws");

        let missing = discovery.find(&PluginName::from("flavor-swarm")).await;
        assert!(matches!(missing, Err(Error::PluginNotFound { .. })));
    }

    #[tokio::test]
    async fn static_remove_hides_endpoint() {
        let discovery = StaticDiscovery::new();
        discovery.register_local("group");
        assert!(discovery.remove("group").is_some());
        assert!(discovery.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn directory_lists_socket_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("group"), "").await.unwrap();
        tokio::fs::write(dir.path().join("ingress"), "").await.unwrap();
        tokio::fs::write(dir.path().join(".hidden"), "").await.unwrap();

        let endpoints = DirectoryDiscovery::new(dir.path()).list().await.unwrap();
        assert_eq!(endpoints.keys().collect::<Vec<_>>(), vec!["group", "ingress"]);
        assert_eq!(endpoints["group"].protocol, "unix");
    }

    #[tokio::test]
    async fn missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = DirectoryDiscovery::new(dir.path().join("plugins"));
        assert!(discovery.list().await.unwrap().is_empty());
    }
}
