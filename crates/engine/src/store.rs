//! Desired-state store.
//!
//! The durable form is an ordered list of [`Persisted`] entries saved as a
//! single document through a [`Snapshot`]. [`SpecStore`] holds that list
//! plus an index keyed by `(kind, name)`; the index is rebuilt on every
//! `load` and flattened back on every `store`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{GROUP_KIND, GroupId, GroupSpec, InterfaceSpec, Metadata, PluginName, Spec};

/// Durable whole-document storage.
#[async_trait]
pub trait Snapshot: Send + Sync {
    /// Load the document. `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<Value>>;

    /// Replace the document.
    async fn save(&self, document: &Value) -> Result<()>;
}

/// In-memory snapshot, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemorySnapshot {
    document: RwLock<Option<Value>>,
}

impl InMemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently saved document.
    pub async fn document(&self) -> Option<Value> {
        self.document.read().await.clone()
    }
}

#[async_trait]
impl Snapshot for InMemorySnapshot {
    async fn load(&self) -> Result<Option<Value>> {
        Ok(self.document.read().await.clone())
    }

    async fn save(&self, document: &Value) -> Result<()> {
        *self.document.write().await = Some(document.clone());
        Ok(())
    }
}

/// Snapshot kept as a JSON file.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    path: PathBuf,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Snapshot for FileSnapshot {
    async fn load(&self) -> Result<Option<Value>> {
        steward_core::document::read_json(&self.path)
            .await
            .map_err(|e| {
                if e.is_malformed() {
                    Error::snapshot("load", e.to_string())
                } else {
                    e.into()
                }
            })
    }

    async fn save(&self, document: &Value) -> Result<()> {
        Ok(steward_core::document::write_json(&self.path, document).await?)
    }
}

/// Identity of a stored spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub kind: String,
    pub name: String,
}

impl Key {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn of(spec: &Spec) -> Self {
        Self::new(spec.kind.clone(), spec.metadata.name.clone())
    }

    pub fn group(id: &GroupId) -> Self {
        Self::new(GROUP_KIND, id.as_str())
    }
}

/// A stored spec together with the plugin that enacts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub handler: PluginName,
    pub interface: InterfaceSpec,
    pub spec: Spec,
}

/// Flattened, serializable form of one index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persisted {
    pub key: Key,
    pub record: Record,
}

/// Indexed view over the persisted specs.
///
/// Not synchronized: callers serialize mutation (the backend routes it
/// through its operation queue).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecStore {
    data: Vec<Persisted>,
    index: BTreeMap<Key, Record>,
}

impl SpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a fresh store from a snapshot.
    ///
    /// # Errors
    ///
    /// See [`SpecStore::load`].
    pub async fn open(snapshot: &dyn Snapshot) -> Result<Self> {
        let mut store = Self::new();
        store.load(snapshot).await?;
        Ok(store)
    }

    /// Read the persisted entries and rebuild the index from scratch.
    ///
    /// Later duplicates of a key replace earlier ones.
    ///
    /// # Errors
    ///
    /// Propagates snapshot read failures; a document that is not a list of
    /// persisted entries is a `Snapshot` error.
    pub async fn load(&mut self, snapshot: &dyn Snapshot) -> Result<()> {
        let data: Vec<Persisted> = match snapshot.load().await? {
            Some(document) => serde_json::from_value(document)
                .map_err(|e| Error::snapshot("load", e.to_string()))?,
            None => Vec::new(),
        };

        self.index = data
            .iter()
            .map(|entry| (entry.key.clone(), entry.record.clone()))
            .collect();
        self.data = data;

        debug!(entries = self.data.len(), specs = self.index.len(), "Loaded spec store");
        Ok(())
    }

    /// Flatten the index and save it.
    ///
    /// # Errors
    ///
    /// Propagates snapshot write failures unchanged; on failure the durable
    /// copy may be stale relative to this store.
    pub async fn store(&mut self, snapshot: &dyn Snapshot) -> Result<()> {
        self.data = self
            .index
            .iter()
            .map(|(key, record)| Persisted {
                key: key.clone(),
                record: record.clone(),
            })
            .collect();

        let document =
            serde_json::to_value(&self.data).map_err(|e| Error::snapshot("save", e.to_string()))?;
        snapshot.save(&document).await?;

        debug!(specs = self.data.len(), "Stored spec store");
        Ok(())
    }

    /// Insert or replace a controller-managed spec.
    pub fn update_spec(&mut self, spec: Spec, handler: PluginName) {
        self.index.insert(
            Key::of(&spec),
            Record {
                handler,
                interface: InterfaceSpec::controller(),
                spec,
            },
        );
    }

    /// Remove a spec; absent keys are ignored.
    pub fn remove_spec(&mut self, kind: &str, metadata: &Metadata) {
        self.index.remove(&Key::new(kind, metadata.name.clone()));
    }

    /// Insert a group spec, or replace only the properties of an existing one.
    ///
    /// The handler of an existing group is kept.
    pub fn update_group_spec(&mut self, group: &GroupSpec, handler: PluginName) {
        let key = Key::group(&group.id);
        match self.index.get_mut(&key) {
            Some(record) => record.spec.properties.clone_from(&group.properties),
            None => {
                self.index.insert(
                    key,
                    Record {
                        handler,
                        interface: InterfaceSpec::group(),
                        spec: group.to_spec(),
                    },
                );
            }
        }
    }

    /// First spec, in key order, whose handler or name matches `plugin`.
    pub fn find_spec(&self, plugin: &PluginName) -> Option<Spec> {
        self.index
            .iter()
            .find(|(key, record)| record.handler.matches(plugin) || key.name == plugin.as_str())
            .map(|(_, record)| record.spec.clone())
    }

    /// Records served by `plugin` through `interface`.
    pub fn records_for<'a>(
        &'a self,
        plugin: &'a PluginName,
        interface: &'a InterfaceSpec,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        self.index
            .values()
            .filter(move |record| record.interface == *interface && record.handler.matches(plugin))
    }

    /// All records in key order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.index.values()
    }

    /// All specs in key order.
    pub fn specs(&self) -> Vec<Spec> {
        self.index.values().map(|record| record.spec.clone()).collect()
    }

    /// All group specs, sorted by id.
    pub fn all_group_specs(&self) -> Vec<GroupSpec> {
        self.index
            .values()
            .filter_map(|record| GroupSpec::try_from(&record.spec).ok())
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }

    /// The group spec stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns `GroupNotFound` when no such group is stored.
    pub fn get_group_spec(&self, id: &GroupId) -> Result<GroupSpec> {
        self.index
            .get(&Key::group(id))
            .ok_or_else(|| Error::group_not_found(id.as_str()))
            .and_then(|record| GroupSpec::try_from(&record.spec))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ingress(name: &str) -> Spec {
        Spec::new("ingress", name).with_properties(json!({"a": 1, "b": 2}))
    }

    #[tokio::test]
    async fn empty_snapshot_loads_empty_store() {
        let snapshot = InMemorySnapshot::new();
        let store = SpecStore::open(&snapshot).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn update_store_load_round_trip() {
        let snapshot = InMemorySnapshot::new();
        let mut store = SpecStore::new();
        store.update_spec(ingress("elb1"), PluginName::from("ingress"));
        store.update_group_spec(
            &GroupSpec::new("managers", Some(json!("hello"))),
            PluginName::from("group"),
        );
        store.store(&snapshot).await.unwrap();

        let reloaded = SpecStore::open(&snapshot).await.unwrap();
        assert_eq!(reloaded.index, store.index);
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn later_duplicate_wins_on_load() {
        let snapshot = InMemorySnapshot::new();
        let first = Persisted {
            key: Key::new("ingress", "elb1"),
            record: Record {
                handler: PluginName::from("ingress"),
                interface: InterfaceSpec::controller(),
                spec: ingress("elb1"),
            },
        };
        let mut second = first.clone();
        second.record.spec = second.record.spec.with_version("v2");
        snapshot
            .save(&serde_json::to_value(vec![first, second]).unwrap())
            .await
            .unwrap();

        let store = SpecStore::open(&snapshot).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.specs()[0].version, "v2");
    }

    #[tokio::test]
    async fn malformed_document_is_a_load_error() {
        let snapshot = InMemorySnapshot::new();
        snapshot.save(&json!({"not": "a list"})).await.unwrap();
        let result = SpecStore::open(&snapshot).await;
        assert!(matches!(result, Err(Error::Snapshot { .. })));
    }

    #[test]
    fn group_update_keeps_original_handler() {
        let mut store = SpecStore::new();
        store.update_group_spec(
            &GroupSpec::new("workers", Some(json!({"size": 1}))),
            PluginName::from("group"),
        );
        store.update_group_spec(
            &GroupSpec::new("workers", Some(json!({"size": 5}))),
            PluginName::from("group-other"),
        );

        let record = store.records().next().unwrap();
        assert_eq!(record.handler, PluginName::from("group"));
        assert_eq!(record.spec.properties, Some(json!({"size": 5})));
        assert_eq!(record.spec.kind, GROUP_KIND);
    }

    #[test]
    fn update_spec_replaces_payload() {
        let mut store = SpecStore::new();
        store.update_spec(ingress("elb1"), PluginName::from("ingress"));
        store.update_spec(
            Spec::new("ingress", "elb1").with_properties(json!({"c": 3})),
            PluginName::from("ingress"),
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.specs()[0].properties, Some(json!({"c": 3})));
    }

    #[test]
    fn find_spec_matches_handler_or_name() {
        let mut store = SpecStore::new();
        store.update_spec(ingress("elb1"), PluginName::from("ingress/elb"));

        assert!(store.find_spec(&PluginName::from("ingress")).is_some());
        assert!(store.find_spec(&PluginName::from("elb1")).is_some());
        assert!(store.find_spec(&PluginName::from("group")).is_none());
    }

    #[test]
    fn group_specs_sorted_by_id() {
        let mut store = SpecStore::new();
        for id in ["workers", "managers", "edge"] {
            store.update_group_spec(&GroupSpec::new(id, None), PluginName::from("group"));
        }
        store.update_spec(ingress("elb1"), PluginName::from("ingress"));

        let ids: Vec<_> = store
            .all_group_specs()
            .into_iter()
            .map(|g| g.id.to_string())
            .collect();
        assert_eq!(ids, vec!["edge", "managers", "workers"]);
    }

    #[test]
    fn get_group_spec_reports_missing() {
        let store = SpecStore::new();
        let result = store.get_group_spec(&GroupId::new("ghost"));
        assert!(matches!(result, Err(Error::GroupNotFound { .. })));
    }

    #[test]
    fn remove_spec_drops_entry() {
        let mut store = SpecStore::new();
        let spec = ingress("elb1");
        store.update_spec(spec.clone(), PluginName::from("ingress"));
        store.remove_spec(&spec.kind, &spec.metadata);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn file_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = FileSnapshot::new(dir.path().join("specs.json"));

        let mut store = SpecStore::new();
        store.update_spec(ingress("elb1"), PluginName::from("ingress"));
        store.store(&snapshot).await.unwrap();

        let reloaded = SpecStore::open(&snapshot).await.unwrap();
        assert_eq!(reloaded.specs(), store.specs());
        assert_eq!(reloaded.records().collect::<Vec<_>>(), store.records().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs.json");
        tokio::fs::write(&path, "[{\"key\":").await.unwrap();

        let result = SpecStore::open(&FileSnapshot::new(&path)).await;
        assert!(matches!(result, Err(Error::Snapshot { .. })), "{result:?}");
    }

    #[derive(Debug, Clone)]
    enum Mutation {
        Update(String, String),
        Group(String, u8),
        Remove(String, String),
    }

    fn mutation() -> impl Strategy<Value = Mutation> {
        let kind = prop_oneof![Just("ingress".to_string()), Just("resource".to_string())];
        let name = "[a-c]{1,2}";
        prop_oneof![
            (kind.clone(), name).prop_map(|(k, n)| Mutation::Update(k, n)),
            (name, any::<u8>()).prop_map(|(n, s)| Mutation::Group(n, s)),
            (kind, name).prop_map(|(k, n)| Mutation::Remove(k, n)),
        ]
    }

    proptest! {
        #[test]
        fn store_then_load_preserves_index(mutations in proptest::collection::vec(mutation(), 0..24)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let snapshot = InMemorySnapshot::new();
                let mut store = SpecStore::new();
                for m in mutations {
                    match m {
                        Mutation::Update(kind, name) => {
                            store.update_spec(Spec::new(kind, name), PluginName::from("ctl"));
                        }
                        Mutation::Group(id, size) => store.update_group_spec(
                            &GroupSpec::new(GroupId::new(id), Some(json!({"size": size}))),
                            PluginName::from("group"),
                        ),
                        Mutation::Remove(kind, name) => {
                            store.remove_spec(&kind, &Metadata::named(name));
                        }
                    }
                }
                let before = store.index.clone();
                store.store(&snapshot).await.unwrap();
                let reloaded = SpecStore::open(&snapshot).await.unwrap();
                prop_assert_eq!(reloaded.index, before);
                Ok(())
            })?;
        }
    }
}
