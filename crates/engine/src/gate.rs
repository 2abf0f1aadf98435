//! Readiness barrier over the plugins the stored specs depend on.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::resolver::ResolverRegistry;
use crate::store::{Key, Record, SpecStore};
use crate::types::{InterfaceSpec, PluginName, Spec};

/// Signal that every dependency was seen in discovery.
#[derive(Debug, Clone)]
pub struct Readiness {
    ready: watch::Receiver<bool>,
}

impl Readiness {
    fn satisfied() -> Self {
        let (_, ready) = watch::channel(true);
        Self { ready }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Block until ready.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if polling ended without reaching readiness.
    pub async fn wait(&mut self) -> Result<()> {
        let outcome = self.ready.wait_for(|ready| *ready).await.map(|_| ());
        outcome.map_err(|_| Error::Stopped)
    }

    /// Block until ready or until `after` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `after` elapses first.
    pub async fn wait_timeout(&mut self, after: Duration) -> Result<()> {
        tokio::time::timeout(after, self.wait())
            .await
            .map_err(|_| Error::timeout("plugin dependencies", after))?
    }
}

/// Waits for dependent plugins to show up in discovery.
#[derive(Clone)]
pub struct DependencyGate {
    discovery: Arc<dyn Discovery>,
    resolvers: ResolverRegistry,
    interval: Duration,
}

impl DependencyGate {
    pub fn new(discovery: Arc<dyn Discovery>, resolvers: ResolverRegistry, interval: Duration) -> Self {
        Self {
            discovery,
            resolvers,
            interval,
        }
    }

    /// Plugins the given records depend on, directly or transitively.
    ///
    /// The records' own handlers are not included.
    ///
    /// # Errors
    ///
    /// Propagates resolver failures.
    pub fn dependencies<'a>(
        &self,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> Result<BTreeSet<PluginName>> {
        let mut found = BTreeSet::new();
        let mut visited = HashSet::new();
        for record in records {
            self.collect(&record.spec, Some(&record.interface), &mut visited, &mut found)?;
        }
        Ok(found)
    }

    fn collect(
        &self,
        spec: &Spec,
        interface: Option<&InterfaceSpec>,
        visited: &mut HashSet<Key>,
        found: &mut BTreeSet<PluginName>,
    ) -> Result<()> {
        if !visited.insert(Key::of(spec)) {
            return Ok(());
        }

        for dependency in &spec.depends {
            let plugin = if dependency.name.is_empty() {
                PluginName::new(dependency.kind.clone())
            } else {
                PluginName::new(format!("{}/{}", dependency.kind, dependency.name))
            };
            found.insert(plugin);
        }

        for runnable in self.resolvers.resolve(spec, interface)? {
            found.insert(runnable.plugin);
            if let Some(nested) = &runnable.spec {
                self.collect(nested, None, visited, found)?;
            }
        }
        Ok(())
    }

    /// Start waiting for every dependency of `store` to be discoverable.
    ///
    /// With no dependencies the returned signal is already satisfied.
    /// Otherwise discovery is polled on the configured interval until every
    /// lookup is listed, or until the returned `Readiness` is dropped.
    ///
    /// # Errors
    ///
    /// Propagates resolver failures.
    pub fn check_plugins_running(&self, store: &SpecStore) -> Result<Readiness> {
        let lookups: BTreeSet<String> = self
            .dependencies(store.records())?
            .iter()
            .map(|plugin| plugin.lookup().to_string())
            .collect();

        if lookups.is_empty() {
            return Ok(Readiness::satisfied());
        }

        info!(plugins = ?lookups, "Waiting for plugin dependencies");
        let (tx, ready) = watch::channel(false);
        let discovery = Arc::clone(&self.discovery);
        let mut ticker = tokio::time::interval(self.interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let listed = match discovery.list().await {
                    Ok(listed) => listed,
                    Err(e) => {
                        warn!(error = %e, "Plugin discovery failed");
                        continue;
                    }
                };

                let missing: Vec<&String> =
                    lookups.iter().filter(|l| !listed.contains_key(*l)).collect();
                if missing.is_empty() {
                    info!("Plugin dependencies running");
                    tx.send_replace(true);
                    break;
                }
                debug!(missing = ?missing, "Plugin dependencies not yet running");
            }
        });

        Ok(Readiness { ready })
    }
}
