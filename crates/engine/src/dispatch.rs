//! Capability dispatch over discovered plugins.
//!
//! Adapters are cached per (lookup, capability), both as connected and as
//! wrapped by a visitor's adapt function. Cache entries are never evicted:
//! a plugin that comes back at a different address under the same lookup
//! keeps being reached through the adapter cached for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use steward_core::ResultExt;
use tracing::debug;

use crate::discovery::{Discovery, Endpoint};
use crate::error::{Error, Result};
use crate::plugin::{Adapter, Capability, Connector, Controller, GroupPlugin};
use crate::types::PluginName;

/// Wraps a freshly connected adapter, e.g. in a queued adapter.
pub type AdaptFn = Arc<dyn Fn(&PluginName, Adapter) -> Adapter + Send + Sync>;

type Work<'a> = Box<dyn FnMut(PluginName, Adapter) -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// Work applied to every reachable plugin of one capability.
pub struct Visitor<'a> {
    capability: Capability,
    adapt: Option<AdaptFn>,
    work: Work<'a>,
}

impl<'a> Visitor<'a> {
    pub fn new<F>(capability: Capability, work: F) -> Self
    where
        F: FnMut(PluginName, Adapter) -> BoxFuture<'a, Result<()>> + Send + 'a,
    {
        Self {
            capability,
            adapt: None,
            work: Box::new(work),
        }
    }

    /// Visit every plugin implementing [`Controller`].
    pub fn controllers<F>(mut work: F) -> Self
    where
        F: FnMut(PluginName, Arc<dyn Controller>) -> BoxFuture<'a, Result<()>> + Send + 'a,
    {
        Self::new(Capability::Controller, move |name, adapter| {
            match adapter.into_controller() {
                Some(controller) => work(name, controller),
                None => futures::future::ready(Ok(())).boxed(),
            }
        })
    }

    /// Visit every plugin implementing [`GroupPlugin`].
    pub fn groups<F>(mut work: F) -> Self
    where
        F: FnMut(PluginName, Arc<dyn GroupPlugin>) -> BoxFuture<'a, Result<()>> + Send + 'a,
    {
        Self::new(Capability::Group, move |name, adapter| match adapter.into_group() {
            Some(group) => work(name, group),
            None => futures::future::ready(Ok(())).boxed(),
        })
    }

    #[must_use]
    pub fn with_adapt(mut self, adapt: AdaptFn) -> Self {
        self.adapt = Some(adapt);
        self
    }
}

#[derive(Clone)]
struct Cached {
    raw: Adapter,
    adapted: Option<Adapter>,
}

/// Resolves discovered endpoints to capability adapters.
pub struct PluginDispatcher {
    discovery: Arc<dyn Discovery>,
    connector: Arc<dyn Connector>,
    self_name: String,
    cache: Mutex<HashMap<(String, Capability), Cached>>,
}

impl PluginDispatcher {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        connector: Arc<dyn Connector>,
        self_name: impl Into<String>,
    ) -> Self {
        Self {
            discovery,
            connector,
            self_name: self_name.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Apply every visitor to every discovered plugin implementing its
    /// capability, in lookup order.
    ///
    /// The engine's own name is skipped. A plugin that cannot be reached is
    /// logged and skipped. The first error returned by a visitor's work
    /// stops the visit and is returned.
    ///
    /// # Errors
    ///
    /// Discovery listing failures and the first work failure.
    pub async fn visit(&self, visitors: &mut [Visitor<'_>]) -> Result<()> {
        let endpoints = self.discovery.list().await?;

        for (lookup, endpoint) in &endpoints {
            if *lookup == self.self_name {
                continue;
            }
            for visitor in visitors.iter_mut() {
                let adapter = self
                    .adapter(lookup, endpoint, visitor.capability, visitor.adapt.as_ref())
                    .await
                    .into_option_logged(&format!("Skipping plugin {lookup}"))
                    .flatten();
                let Some(adapter) = adapter else { continue };

                debug!(plugin = %lookup, capability = %visitor.capability, "Visiting plugin");
                (visitor.work)(PluginName::new(lookup.clone()), adapter).await?;
            }
        }
        Ok(())
    }

    /// The adapter for one named plugin.
    ///
    /// # Errors
    ///
    /// `PluginNotFound` when discovery does not list it, `Connect` when it
    /// cannot be reached and `NotImplemented` when it lacks `capability`.
    pub async fn resolve(
        &self,
        name: &PluginName,
        capability: Capability,
        adapt: Option<&AdaptFn>,
    ) -> Result<Adapter> {
        let endpoint = self.discovery.find(name).await?;
        self.adapter(name.lookup(), &endpoint, capability, adapt)
            .await?
            .ok_or_else(|| Error::not_implemented(name.as_str(), capability.to_string()))
    }

    async fn adapter(
        &self,
        lookup: &str,
        endpoint: &Endpoint,
        capability: Capability,
        adapt: Option<&AdaptFn>,
    ) -> Result<Option<Adapter>> {
        let key = (lookup.to_string(), capability);
        let cached = self.lock().get(&key).cloned();

        let entry = match cached {
            Some(entry) => entry,
            None => {
                let Some(raw) = self.connector.connect(endpoint, capability).await? else {
                    debug!(plugin = %lookup, %capability, "Capability not implemented");
                    return Ok(None);
                };
                Cached { raw, adapted: None }
            }
        };

        let Some(adapt) = adapt else {
            self.lock().entry(key).or_insert(entry.clone());
            return Ok(Some(entry.raw));
        };

        if let Some(adapted) = entry.adapted {
            return Ok(Some(adapted));
        }

        let adapted = adapt(&PluginName::new(lookup), entry.raw.clone());
        let mut cache = self.lock();
        let slot = cache.entry(key).or_insert(Cached {
            raw: entry.raw,
            adapted: None,
        });
        Ok(Some(slot.adapted.get_or_insert(adapted).clone()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, Capability), Cached>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::arithmetic_side_effects
)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::plugin::LocalConnector;
    use crate::types::{Metadata, Object, Operation, Plan, Spec};

    struct Echo;

    #[async_trait]
    impl Controller for Echo {
        async fn plan(&self, _operation: Operation, spec: &Spec) -> Result<(Object, Plan)> {
            Ok((Object::new(spec.clone()), Plan::default()))
        }
        async fn commit(&self, _operation: Operation, spec: &Spec) -> Result<Object> {
            Ok(Object::new(spec.clone()))
        }
        async fn describe(&self, _search: Option<&Metadata>) -> Result<Vec<Object>> {
            Ok(Vec::new())
        }
        async fn specs(&self, _search: Option<&Metadata>) -> Result<Vec<Spec>> {
            Ok(Vec::new())
        }
        async fn pause(&self, _search: Option<&Metadata>) -> Result<Vec<Object>> {
            Ok(Vec::new())
        }
        async fn terminate(&self, _search: Option<&Metadata>) -> Result<Vec<Object>> {
            Ok(Vec::new())
        }
    }

    /// Counts connection attempts.
    struct Counting {
        inner: LocalConnector,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Counting {
        async fn connect(
            &self,
            endpoint: &Endpoint,
            capability: Capability,
        ) -> Result<Option<Adapter>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.inner.connect(endpoint, capability).await
        }
    }

    fn setup(lookups: &[&str]) -> (Arc<StaticDiscovery>, Arc<Counting>, PluginDispatcher) {
        let discovery = Arc::new(StaticDiscovery::new());
        let local = LocalConnector::new();
        for lookup in lookups {
            discovery.register_local(lookup);
            local.register_controller(*lookup, Arc::new(Echo));
        }
        let connector = Arc::new(Counting {
            inner: local,
            connects: AtomicUsize::new(0),
        });
        let dispatcher = PluginDispatcher::new(
            Arc::clone(&discovery) as Arc<dyn Discovery>,
            Arc::clone(&connector) as Arc<dyn Connector>,
            "steward",
        );
        (discovery, connector, dispatcher)
    }

    #[tokio::test]
    async fn visits_in_lookup_order_and_skips_self() {
        let (_discovery, _connector, dispatcher) = setup(&["resource", "ingress", "steward"]);
        let mut seen = Vec::new();
        {
            let seen = &mut seen;
            let mut visitors = [Visitor::controllers(move |name, _| {
                seen.push(name.to_string());
                futures::future::ready(Ok(())).boxed()
            })];
            dispatcher.visit(&mut visitors).await.unwrap();
        }
        assert_eq!(seen, vec!["ingress", "resource"]);
    }

    #[tokio::test]
    async fn adapters_are_cached_per_capability() {
        let (_discovery, connector, dispatcher) = setup(&["ingress"]);
        for _ in 0..3 {
            let mut visitors = [Visitor::controllers(|_, _| futures::future::ready(Ok(())).boxed())];
            dispatcher.visit(&mut visitors).await.unwrap();
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_capability_is_skipped() {
        let (_discovery, _connector, dispatcher) = setup(&["ingress"]);
        let mut calls = 0;
        {
            let calls = &mut calls;
            let mut visitors = [Visitor::groups(move |_, _| {
                *calls += 1;
                futures::future::ready(Ok(())).boxed()
            })];
            dispatcher.visit(&mut visitors).await.unwrap();
        }
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn unreachable_plugin_is_skipped() {
        let (discovery, _connector, dispatcher) = setup(&["ingress"]);
        discovery.register_local("ghost");
        let mut seen = Vec::new();
        {
            let seen = &mut seen;
            let mut visitors = [Visitor::controllers(move |name, _| {
                seen.push(name.to_string());
                futures::future::ready(Ok(())).boxed()
            })];
            dispatcher.visit(&mut visitors).await.unwrap();
        }
        assert_eq!(seen, vec!["ingress"]);
    }

    #[tokio::test]
    async fn first_work_error_stops_the_visit() {
        let (_discovery, _connector, dispatcher) = setup(&["a", "b", "c"]);
        let mut seen = Vec::new();
        let result = {
            let seen = &mut seen;
            let mut visitors = [Visitor::controllers(move |name, _| {
                seen.push(name.to_string());
                let failed = name.as_str() == "b";
                async move {
                    if failed {
                        Err(Error::plugin("b", "commit", "boom"))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            })];
            dispatcher.visit(&mut visitors).await
        };
        assert!(matches!(result, Err(Error::Plugin { .. })));
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn adapt_runs_once_and_is_cached() {
        let (_discovery, _connector, dispatcher) = setup(&["ingress"]);
        let adapts = Arc::new(AtomicUsize::new(0));
        let adapt: AdaptFn = {
            let adapts = Arc::clone(&adapts);
            Arc::new(move |_: &PluginName, adapter: Adapter| {
                adapts.fetch_add(1, Ordering::SeqCst);
                adapter
            })
        };

        let name = PluginName::from("ingress");
        for _ in 0..2 {
            dispatcher
                .resolve(&name, Capability::Controller, Some(&adapt))
                .await
                .unwrap();
        }
        assert_eq!(adapts.load(Ordering::SeqCst), 1);

        let missing = dispatcher
            .resolve(&name, Capability::Group, None)
            .await;
        assert!(matches!(missing, Err(Error::NotImplemented { .. })));
    }
}
