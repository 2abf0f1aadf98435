//! Dependency resolvers.
//!
//! A resolver infers, from a spec's opaque properties, which other plugins
//! must be running for that spec to be enacted. Resolvers are registered
//! per kind and interface.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, RwLock};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{GROUP_KIND, InterfaceSpec, PluginName, Spec};

/// Something that must be running, derived from a spec.
#[derive(Debug, Clone, PartialEq)]
pub struct Runnable {
    pub kind: String,
    pub plugin: PluginName,
    /// The spec the runnable is itself driven by, if any.
    pub spec: Option<Spec>,
}

impl Runnable {
    pub fn new(kind: impl Into<String>, plugin: impl Into<PluginName>) -> Self {
        Self {
            kind: kind.into(),
            plugin: plugin.into(),
            spec: None,
        }
    }

    #[must_use]
    pub fn with_spec(mut self, spec: Spec) -> Self {
        self.spec = Some(spec);
        self
    }
}

/// Infers the runnables a spec depends on.
pub type ResolveFn = Arc<dyn Fn(&Spec) -> Result<Vec<Runnable>> + Send + Sync>;

type Table = BTreeMap<(String, InterfaceSpec), ResolveFn>;

/// Kind + interface to resolver table.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    table: Arc<RwLock<Table>>,
}

static GLOBAL: LazyLock<ResolverRegistry> = LazyLock::new(|| {
    let registry = ResolverRegistry::new();
    registry.register(GROUP_KIND, InterfaceSpec::group(), Arc::new(resolve_group));
    registry
});

impl ResolverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, with the group resolver pre-registered.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Register (or replace) the resolver for `kind` under `interface`.
    pub fn register(&self, kind: impl Into<String>, interface: InterfaceSpec, resolve: ResolveFn) {
        self.table
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((kind.into(), interface), resolve);
    }

    /// Runnables inferred for `spec`.
    ///
    /// With an interface, only the resolver registered under exactly that
    /// interface is consulted; without one, every resolver for the kind is.
    ///
    /// # Errors
    ///
    /// Propagates the first resolver failure.
    pub fn resolve(&self, spec: &Spec, interface: Option<&InterfaceSpec>) -> Result<Vec<Runnable>> {
        let resolvers: Vec<ResolveFn> = {
            let table = self
                .table
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            table
                .iter()
                .filter(|((kind, registered), _)| {
                    *kind == spec.kind && interface.is_none_or(|wanted| wanted == registered)
                })
                .map(|(_, resolve)| Arc::clone(resolve))
                .collect()
        };

        let mut runnables = Vec::new();
        for resolve in resolvers {
            runnables.extend(resolve(spec)?);
        }
        Ok(runnables)
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self
            .table
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_set().entries(table.keys()).finish()
    }
}

/// A group depends on its instance plugin and its flavor plugin.
fn resolve_group(spec: &Spec) -> Result<Vec<Runnable>> {
    let Some(properties) = &spec.properties else {
        return Ok(Vec::new());
    };

    ["Instance", "Flavor"]
        .into_iter()
        .filter_map(|section| {
            plugin_of(properties, section)
                .transpose()
                .map(|plugin| plugin.map(|plugin| Runnable::new(section.to_lowercase(), plugin)))
        })
        .collect()
}

fn plugin_of(properties: &Value, section: &str) -> Result<Option<PluginName>> {
    match properties.get(section).and_then(|s| s.get("Plugin")) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) if !name.is_empty() => Ok(Some(PluginName::new(name.clone()))),
        Some(other) => Err(Error::resolve(
            GROUP_KIND,
            format!("{section}.Plugin must be a plugin name, got {other}"),
        )),
    }
}
