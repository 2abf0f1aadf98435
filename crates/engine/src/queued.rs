//! Queued plugin adapters.
//!
//! Each mutating call records its effect on the desired state and then
//! forwards to the wrapped plugin, both inside one queued operation, so no
//! other queued operation can interleave between the two steps. Reads of
//! desired state are answered from the ledger; reads of observed state go
//! straight to the plugin.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::ledger::SpecLedger;
use crate::plugin::{Controller, GroupPlugin};
use crate::queue::QueueHandle;
use crate::types::{
    GroupDescription, GroupId, GroupSpec, Metadata, Object, Operation, Plan, PluginName, Spec,
};

/// A [`Controller`] whose mutations go through the operation queue.
pub struct QueuedController {
    handler: PluginName,
    inner: Arc<dyn Controller>,
    ledger: Arc<dyn SpecLedger>,
    queue: QueueHandle,
    timeout: Option<Duration>,
}

impl QueuedController {
    pub fn new(
        handler: PluginName,
        inner: Arc<dyn Controller>,
        ledger: Arc<dyn SpecLedger>,
        queue: QueueHandle,
    ) -> Self {
        Self {
            handler,
            inner,
            ledger,
            queue,
            timeout: None,
        }
    }

    /// Bound every queued call by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Remove every spec matching `search` from the ledger, then pause or
    /// terminate the matching objects.
    ///
    /// Removal is best effort: a spec that fails to be removed is logged
    /// and the call still goes through to the plugin.
    async fn unmanage(&self, release: Release, search: Option<&Metadata>) -> Result<Vec<Object>> {
        let inner = Arc::clone(&self.inner);
        let ledger = Arc::clone(&self.ledger);
        let handler = self.handler.clone();
        let search = search.cloned();

        self.queue
            .run_bounded(format!("{release} {handler}"), self.timeout, move || async move {
                let specs = ledger.find(search.as_ref(), &handler).await?;
                for spec in &specs {
                    if let Err(e) = ledger.remove(&spec.kind, &spec.metadata).await {
                        warn!(
                            plugin = %handler,
                            kind = %spec.kind,
                            name = %spec.metadata.name,
                            error = %e,
                            "Failed to remove spec"
                        );
                    }
                }
                match release {
                    Release::Pause => inner.pause(search.as_ref()).await,
                    Release::Terminate => inner.terminate(search.as_ref()).await,
                }
            })
            .await
    }
}

#[derive(Debug, Clone, Copy)]
enum Release {
    Pause,
    Terminate,
}

impl std::fmt::Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause => f.write_str("pause"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

#[async_trait]
impl Controller for QueuedController {
    /// Enforce plans are built from what the plugin already describes: an
    /// existing object is updated, otherwise one is created. Destroy plans
    /// come from the plugin.
    async fn plan(&self, operation: Operation, spec: &Spec) -> Result<(Object, Plan)> {
        debug!(plugin = %self.handler, %operation, name = %spec.metadata.name, "Planning");
        if operation == Operation::Destroy {
            return self.inner.plan(operation, spec).await;
        }
        let existing = self.inner.describe(Some(&spec.metadata)).await?;
        Ok(match existing.into_iter().next() {
            Some(object) => (object, Plan::message("update-existing")),
            None => (Object::new(spec.clone()), Plan::message("create-new")),
        })
    }

    async fn commit(&self, operation: Operation, spec: &Spec) -> Result<Object> {
        spec.validate()?;
        let inner = Arc::clone(&self.inner);
        let ledger = Arc::clone(&self.ledger);
        let handler = self.handler.clone();
        let spec = spec.clone();
        let context = format!("commit {operation} {}/{}", spec.kind, spec.metadata.name);

        self.queue
            .run_bounded(context, self.timeout, move || async move {
                match operation {
                    Operation::Enforce => ledger.update(&spec, &handler).await?,
                    Operation::Destroy => ledger.remove(&spec.kind, &spec.metadata).await?,
                }
                inner.commit(operation, &spec).await
            })
            .await
    }

    async fn describe(&self, search: Option<&Metadata>) -> Result<Vec<Object>> {
        self.inner.describe(search).await
    }

    async fn specs(&self, search: Option<&Metadata>) -> Result<Vec<Spec>> {
        self.ledger.find(search, &self.handler).await
    }

    async fn pause(&self, search: Option<&Metadata>) -> Result<Vec<Object>> {
        self.unmanage(Release::Pause, search).await
    }

    async fn terminate(&self, search: Option<&Metadata>) -> Result<Vec<Object>> {
        self.unmanage(Release::Terminate, search).await
    }
}

/// A [`GroupPlugin`] whose mutations go through the operation queue.
pub struct QueuedGroupPlugin {
    handler: PluginName,
    inner: Arc<dyn GroupPlugin>,
    ledger: Arc<dyn SpecLedger>,
    queue: QueueHandle,
    timeout: Option<Duration>,
}

impl QueuedGroupPlugin {
    pub fn new(
        handler: PluginName,
        inner: Arc<dyn GroupPlugin>,
        ledger: Arc<dyn SpecLedger>,
        queue: QueueHandle,
    ) -> Self {
        Self {
            handler,
            inner,
            ledger,
            queue,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl GroupPlugin for QueuedGroupPlugin {
    async fn commit_group(&self, spec: &GroupSpec, pretend: bool) -> Result<String> {
        let inner = Arc::clone(&self.inner);
        let ledger = Arc::clone(&self.ledger);
        let handler = self.handler.clone();
        let spec = spec.clone();
        let context = format!("commit group {}", spec.id);

        self.queue
            .run_bounded(context, self.timeout, move || async move {
                if !pretend {
                    ledger.update_group(&spec, &handler).await?;
                }
                inner.commit_group(&spec, pretend).await
            })
            .await
    }

    async fn inspect_groups(&self) -> Result<Vec<GroupSpec>> {
        self.ledger.group_specs(&self.handler).await
    }

    async fn describe_group(&self, id: &GroupId) -> Result<GroupDescription> {
        self.inner.describe_group(id).await
    }

    async fn destroy_group(&self, id: &GroupId) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let ledger = Arc::clone(&self.ledger);
        let id = id.clone();

        self.queue
            .run_bounded(format!("destroy group {id}"), self.timeout, move || async move {
                ledger.remove_group(&id).await?;
                inner.destroy_group(&id).await
            })
            .await
    }

    async fn free_group(&self, id: &GroupId) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let ledger = Arc::clone(&self.ledger);
        let id = id.clone();

        self.queue
            .run_bounded(format!("free group {id}"), self.timeout, move || async move {
                ledger.remove_group(&id).await?;
                inner.free_group(&id).await
            })
            .await
    }

    async fn size(&self, id: &GroupId) -> Result<usize> {
        self.inner.size(id).await
    }

    async fn set_size(&self, id: &GroupId, size: usize) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let id = id.clone();

        self.queue
            .run_bounded(format!("set size {id}"), self.timeout, move || async move {
                inner.set_size(&id, size).await
            })
            .await
    }
}
