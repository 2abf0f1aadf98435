//! Store mutation callbacks for queued adapters.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::store::{Snapshot, SpecStore};
use crate::types::{GroupId, GroupSpec, InterfaceSpec, Metadata, PluginName, Spec};

/// Reads and writes of desired state on behalf of one plugin.
#[async_trait]
pub trait SpecLedger: Send + Sync {
    /// Controller specs served by `handler` that match `search`.
    async fn find(&self, search: Option<&Metadata>, handler: &PluginName) -> Result<Vec<Spec>>;

    async fn update(&self, spec: &Spec, handler: &PluginName) -> Result<()>;

    async fn remove(&self, kind: &str, metadata: &Metadata) -> Result<()>;

    /// Group specs owned by `handler`, sorted by id.
    async fn group_specs(&self, handler: &PluginName) -> Result<Vec<GroupSpec>>;

    async fn update_group(&self, group: &GroupSpec, handler: &PluginName) -> Result<()>;

    async fn remove_group(&self, id: &GroupId) -> Result<()>;
}

/// Ledger that reloads the store from the snapshot on every call and saves
/// it after every mutation.
///
/// Callers serialize mutation; the backend does so through its queue.
#[derive(Clone)]
pub struct SnapshotLedger {
    snapshot: Arc<dyn Snapshot>,
}

impl SnapshotLedger {
    pub fn new(snapshot: Arc<dyn Snapshot>) -> Self {
        Self { snapshot }
    }

    async fn open(&self) -> Result<SpecStore> {
        SpecStore::open(self.snapshot.as_ref()).await
    }

    async fn mutate(&self, change: impl FnOnce(&mut SpecStore) + Send) -> Result<()> {
        let mut store = self.open().await?;
        change(&mut store);
        store.store(self.snapshot.as_ref()).await
    }
}

#[async_trait]
impl SpecLedger for SnapshotLedger {
    async fn find(&self, search: Option<&Metadata>, handler: &PluginName) -> Result<Vec<Spec>> {
        let store = self.open().await?;
        let interface = InterfaceSpec::controller();
        Ok(store
            .records_for(handler, &interface)
            .filter(|record| search.is_none_or(|search| record.spec.metadata.matches(search)))
            .map(|record| record.spec.clone())
            .collect())
    }

    async fn update(&self, spec: &Spec, handler: &PluginName) -> Result<()> {
        spec.validate()?;
        self.mutate(|store| store.update_spec(spec.clone(), handler.clone()))
            .await
    }

    async fn remove(&self, kind: &str, metadata: &Metadata) -> Result<()> {
        self.mutate(|store| store.remove_spec(kind, metadata)).await
    }

    async fn group_specs(&self, handler: &PluginName) -> Result<Vec<GroupSpec>> {
        let store = self.open().await?;
        let interface = InterfaceSpec::group();
        store
            .records_for(handler, &interface)
            .map(|record| GroupSpec::try_from(&record.spec))
            .collect()
    }

    async fn update_group(&self, group: &GroupSpec, handler: &PluginName) -> Result<()> {
        self.mutate(|store| store.update_group_spec(group, handler.clone()))
            .await
    }

    async fn remove_group(&self, id: &GroupId) -> Result<()> {
        self.mutate(|store| store.remove_spec(crate::types::GROUP_KIND, &Metadata::named(id.as_str())))
            .await
    }
}
