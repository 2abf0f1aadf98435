//! The backend: leadership-driven reconciliation over discovered plugins.
//!
//! One consumer task owns all mutation. It receives leadership edges and
//! queued operations; edges run the assume or lose pass directly, queued
//! operations run only while this process is leader and otherwise wait.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::dispatch::{AdaptFn, PluginDispatcher, Visitor};
use crate::error::{Error, Result};
use crate::gate::DependencyGate;
use crate::leadership::{Leadership, LeadershipMonitor};
use crate::ledger::{SnapshotLedger, SpecLedger};
use crate::plugin::{Adapter, Capability, Connector, Controller, GroupPlugin};
use crate::queue::{Backlog, OperationQueue, stopped};
use crate::queued::{QueuedController, QueuedGroupPlugin};
use crate::resolver::ResolverRegistry;
use crate::store::{Snapshot, SpecStore};
use crate::types::{
    GROUP_KIND, GroupId, GroupSpec, InterfaceSpec, Object, Operation, PluginName, Spec,
};

/// Handle on a started backend.
#[derive(Debug, Clone)]
pub struct Running {
    done: watch::Receiver<bool>,
}

impl Running {
    /// Whether the consumer task has exited.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait for the consumer task to exit.
    pub async fn wait(&mut self) {
        stopped(&mut self.done).await;
    }
}

/// Builder for [`Backend`].
pub struct BackendBuilder {
    config: EngineConfig,
    snapshot: Option<Arc<dyn Snapshot>>,
    leadership: Option<Arc<dyn Leadership>>,
    discovery: Option<Arc<dyn Discovery>>,
    connector: Option<Arc<dyn Connector>>,
    resolvers: Option<ResolverRegistry>,
}

impl BackendBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            snapshot: None,
            leadership: None,
            discovery: None,
            connector: None,
            resolvers: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Arc<dyn Snapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn with_leadership(mut self, leadership: Arc<dyn Leadership>) -> Self {
        self.leadership = Some(leadership);
        self
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use `resolvers` instead of the process-wide registry.
    #[must_use]
    pub fn with_resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = Some(resolvers);
        self
    }

    /// Build the backend.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the configuration is invalid or a
    /// snapshot, leadership detector, discovery or connector is missing.
    pub fn build(self) -> Result<Backend> {
        self.config.validate()?;

        let snapshot = self
            .snapshot
            .ok_or_else(|| Error::invalid_config("a snapshot is required"))?;
        let leadership = self
            .leadership
            .ok_or_else(|| Error::invalid_config("a leadership detector is required"))?;
        let discovery = self
            .discovery
            .ok_or_else(|| Error::invalid_config("plugin discovery is required"))?;
        let connector = self
            .connector
            .ok_or_else(|| Error::invalid_config("a plugin connector is required"))?;
        let resolvers = self.resolvers.unwrap_or_else(ResolverRegistry::global);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (leader, _) = watch::channel(false);

        let inner = Inner {
            dispatcher: PluginDispatcher::new(Arc::clone(&discovery), connector, &self.config.name),
            gate: DependencyGate::new(discovery, resolvers, self.config.poll_interval()),
            queue: Arc::new(OperationQueue::new(self.config.queue_capacity, stop_rx)),
            ledger: Arc::new(SnapshotLedger::new(Arc::clone(&snapshot))),
            snapshot,
            leadership,
            leader,
            stop: Mutex::new(Some(stop_tx)),
            running: tokio::sync::Mutex::new(None),
            config: self.config,
        };

        Ok(Backend {
            inner: Arc::new(inner),
        })
    }
}

impl Default for BackendBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    config: EngineConfig,
    snapshot: Arc<dyn Snapshot>,
    leadership: Arc<dyn Leadership>,
    dispatcher: PluginDispatcher,
    gate: DependencyGate,
    queue: Arc<OperationQueue>,
    ledger: Arc<dyn SpecLedger>,
    leader: watch::Sender<bool>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

/// Leadership-gated reconciliation engine.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

impl Backend {
    pub fn builder() -> BackendBuilder {
        BackendBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start the leadership monitor and the consumer task.
    ///
    /// Calling `start` again returns the same handle.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after [`Backend::stop`], or the detector's error
    /// if it fails to start.
    pub async fn start(&self) -> Result<Running> {
        let mut running = self.inner.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.clone());
        }

        let stop = self
            .inner
            .stop
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(watch::Sender::subscribe)
            .ok_or(Error::Stopped)?;
        let events = self.inner.leadership.start().await?;
        let backlog = self.inner.queue.take_backlog().ok_or(Error::Stopped)?;

        let (edges_tx, edges_rx) = mpsc::channel(8);
        LeadershipMonitor::new().spawn(events, edges_tx, stop.clone());

        let (done_tx, done) = watch::channel(false);
        tokio::spawn(consume(
            Arc::clone(&self.inner),
            edges_rx,
            backlog,
            stop,
            done_tx,
        ));

        info!(name = %self.inner.config.name, "Backend started");
        let handle = Running { done };
        *running = Some(handle.clone());
        Ok(handle)
    }

    /// Signal every task to stop. Later calls do nothing.
    pub async fn stop(&self) {
        let stop = self
            .inner
            .stop
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(stop) = stop else { return };

        stop.send_replace(true);
        self.inner.leadership.stop().await;
        self.inner.queue.close();
        info!(name = %self.inner.config.name, "Backend stopping");
    }

    pub fn is_leader(&self) -> bool {
        *self.inner.leader.borrow()
    }

    /// Watch leadership changes as seen by the consumer task.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.inner.leader.subscribe()
    }

    /// The named plugin's controller, behind the operation queue.
    ///
    /// # Errors
    ///
    /// As [`PluginDispatcher::resolve`].
    pub async fn controller(&self, name: &PluginName) -> Result<Arc<dyn Controller>> {
        self.inner
            .dispatcher
            .resolve(name, Capability::Controller, Some(&self.queued_adapter()))
            .await?
            .into_controller()
            .ok_or_else(|| Error::not_implemented(name.as_str(), Capability::Controller.to_string()))
    }

    /// The named plugin's group manager, behind the operation queue.
    ///
    /// # Errors
    ///
    /// As [`PluginDispatcher::resolve`].
    pub async fn group_plugin(&self, name: &PluginName) -> Result<Arc<dyn GroupPlugin>> {
        self.inner
            .dispatcher
            .resolve(name, Capability::Group, Some(&self.queued_adapter()))
            .await?
            .into_group()
            .ok_or_else(|| Error::not_implemented(name.as_str(), Capability::Group.to_string()))
    }

    fn queued_adapter(&self) -> AdaptFn {
        let queue = Arc::clone(&self.inner.queue);
        let ledger = Arc::clone(&self.inner.ledger);
        let timeout = self.inner.config.run_timeout();

        Arc::new(move |name: &PluginName, adapter: Adapter| match adapter {
            Adapter::Controller(raw) => Adapter::Controller(Arc::new(
                QueuedController::new(name.clone(), raw, Arc::clone(&ledger), queue.producer())
                    .with_timeout(timeout),
            )),
            Adapter::Group(raw) => Adapter::Group(Arc::new(
                QueuedGroupPlugin::new(name.clone(), raw, Arc::clone(&ledger), queue.producer())
                    .with_timeout(timeout),
            )),
        })
    }

    /// Record and apply each spec through the plugin named by its kind.
    ///
    /// Blocks while this process is not leader.
    ///
    /// # Errors
    ///
    /// Stops at the first spec that cannot be resolved or committed.
    pub async fn enforce(&self, specs: &[Spec]) -> Result<()> {
        for spec in specs {
            spec.validate()?;
            let handler = PluginName::new(spec.kind.clone());
            if spec.kind == GROUP_KIND {
                let group = GroupSpec::try_from(spec)?;
                let message = self.group_plugin(&handler).await?.commit_group(&group, false).await?;
                debug!(group = %group.id, %message, "Enforced group");
            } else {
                self.controller(&handler)
                    .await?
                    .commit(Operation::Enforce, spec)
                    .await?;
                debug!(kind = %spec.kind, name = %spec.metadata.name, "Enforced spec");
            }
        }
        Ok(())
    }

    /// Forget and tear down each spec's object.
    ///
    /// # Errors
    ///
    /// Stops at the first spec that cannot be resolved or terminated.
    pub async fn terminate(&self, specs: &[Spec]) -> Result<()> {
        for spec in specs {
            let handler = PluginName::new(spec.kind.clone());
            if spec.kind == GROUP_KIND {
                self.group_plugin(&handler)
                    .await?
                    .destroy_group(&GroupId::new(spec.metadata.name.clone()))
                    .await?;
            } else {
                self.controller(&handler)
                    .await?
                    .terminate(Some(&spec.metadata))
                    .await?;
            }
        }
        Ok(())
    }

    /// Every stored spec.
    ///
    /// # Errors
    ///
    /// Snapshot read failures.
    pub async fn specs(&self) -> Result<Vec<Spec>> {
        Ok(SpecStore::open(self.inner.snapshot.as_ref()).await?.specs())
    }

    /// The stored spec served by `plugin`, if any.
    ///
    /// # Errors
    ///
    /// Snapshot read failures.
    pub async fn find_spec(&self, plugin: &PluginName) -> Result<Option<Spec>> {
        Ok(SpecStore::open(self.inner.snapshot.as_ref()).await?.find_spec(plugin))
    }

    /// Observed objects of every reachable plugin. Groups are reported as
    /// objects whose state is the group description.
    ///
    /// # Errors
    ///
    /// Snapshot read failures and the first failing plugin call.
    pub async fn inspect(&self) -> Result<Vec<Object>> {
        let store = SpecStore::open(self.inner.snapshot.as_ref()).await?;
        let store = &store;
        let objects = Arc::new(Mutex::new(Vec::new()));

        let controllers = Arc::clone(&objects);
        let groups = Arc::clone(&objects);
        let mut visitors = [
            Visitor::controllers(move |_, controller| {
                let objects = Arc::clone(&controllers);
                async move {
                    let described = controller.describe(None).await?;
                    objects
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .extend(described);
                    Ok::<_, Error>(())
                }
                .boxed()
            }),
            Visitor::groups(move |name, group| {
                let objects = Arc::clone(&groups);
                async move {
                    let interface = InterfaceSpec::group();
                    for record in store.records_for(&name, &interface) {
                        let spec = GroupSpec::try_from(&record.spec)?;
                        let description = group.describe_group(&spec.id).await?;
                        let state = serde_json::to_value(&description)
                            .map_err(|e| Error::plugin(name.as_str(), "describe_group", e.to_string()))?;
                        objects
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .push(Object {
                                spec: record.spec.clone(),
                                state: Some(state),
                            });
                    }
                    Ok::<_, Error>(())
                }
                .boxed()
            }),
        ];
        self.inner.dispatcher.visit(&mut visitors).await?;
        drop(visitors);

        let objects = std::mem::take(
            &mut *objects
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        Ok(objects)
    }

    /// Store a group spec through the operation queue.
    ///
    /// Blocks while this process is not leader.
    ///
    /// # Errors
    ///
    /// Snapshot failures, or `QueueClosed` if the backend stops first.
    pub async fn update_group_spec(&self, group: GroupSpec, handler: PluginName) -> Result<()> {
        let ledger = Arc::clone(&self.inner.ledger);
        let context = format!("update group spec {}", group.id);
        self.inner
            .queue
            .handle()
            .run_bounded(context, self.inner.config.run_timeout(), move || async move {
                ledger.update_group(&group, &handler).await
            })
            .await
    }

    /// Enqueue an arbitrary operation behind the leadership gate.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` if the backend has stopped.
    pub async fn enqueue(&self, backlog: Backlog) -> Result<()> {
        self.inner.queue.handle().enqueue(backlog).await
    }
}

async fn consume(
    inner: Arc<Inner>,
    mut edges: mpsc::Receiver<bool>,
    mut backlog: mpsc::Receiver<Backlog>,
    mut stop: watch::Receiver<bool>,
    done: watch::Sender<bool>,
) {
    let mut edges_open = true;
    loop {
        let leader = *inner.leader.borrow();
        tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            edge = edges.recv(), if edges_open => {
                let Some(edge) = edge else {
                    debug!("Leadership events ended");
                    edges_open = false;
                    continue;
                };
                inner.leader.send_replace(edge);
                let pass = if edge {
                    inner.on_assume_leadership(&mut edges, &stop).await
                } else {
                    inner.on_lost_leadership().await
                };
                if let Err(e) = pass {
                    error!(leader = edge, error = %e, "Reconciliation pass failed");
                }
            }
            entry = backlog.recv(), if leader => {
                let Some(entry) = entry else { break };
                entry.execute().await;
            }
        }
    }
    done.send_replace(true);
    info!(name = %inner.config.name, "Backend stopped");
}

/// Latest edge already waiting in `edges`, if any.
fn pending_edge(edges: &mut mpsc::Receiver<bool>) -> Option<bool> {
    std::iter::from_fn(|| edges.try_recv().ok()).last()
}

impl Inner {
    /// Step down in the middle of a takeover.
    async fn abandon_takeover(&self) -> Result<()> {
        warn!(name = %self.config.name, "Leadership lost before takeover finished");
        self.leader.send_replace(false);
        self.on_lost_leadership().await
    }

    async fn on_assume_leadership(
        &self,
        edges: &mut mpsc::Receiver<bool>,
        stop: &watch::Receiver<bool>,
    ) -> Result<()> {
        info!(name = %self.config.name, "Assuming leadership");
        let store = SpecStore::open(self.snapshot.as_ref()).await?;

        let mut readiness = self.gate.check_plugins_running(&store)?;
        let mut stop = stop.clone();
        let dependencies = async {
            match self.config.dependency_timeout() {
                Some(after) => readiness.wait_timeout(after).await,
                None => readiness.wait().await,
            }
        };
        tokio::pin!(dependencies);
        let mut edges_open = true;
        loop {
            tokio::select! {
                biased;
                () = stopped(&mut stop) => return Err(Error::Stopped),
                edge = edges.recv(), if edges_open => match edge {
                    Some(false) => return self.abandon_takeover().await,
                    Some(true) => {}
                    None => edges_open = false,
                },
                ready = &mut dependencies => {
                    ready?;
                    break;
                }
            }
        }
        if pending_edge(edges) == Some(false) || !*self.leader.borrow() {
            return self.abandon_takeover().await;
        }

        let store = &store;
        let mut visitors = [
            Visitor::controllers(move |name, controller| {
                async move {
                    let interface = InterfaceSpec::controller();
                    for record in store.records_for(&name, &interface) {
                        let spec = &record.spec;
                        if let Err(e) = controller.commit(Operation::Enforce, spec).await {
                            warn!(
                                plugin = %name,
                                kind = %spec.kind,
                                name = %spec.metadata.name,
                                error = %e,
                                "Commit failed"
                            );
                        }
                    }
                    Ok::<_, Error>(())
                }
                .boxed()
            }),
            Visitor::groups(move |name, group| {
                async move {
                    let interface = InterfaceSpec::group();
                    for record in store.records_for(&name, &interface) {
                        let spec = GroupSpec::try_from(&record.spec)?;
                        match group.commit_group(&spec, false).await {
                            Ok(message) => debug!(plugin = %name, group = %spec.id, %message, "Committed group"),
                            Err(e) => warn!(plugin = %name, group = %spec.id, error = %e, "Group commit failed"),
                        }
                    }
                    Ok::<_, Error>(())
                }
                .boxed()
            }),
        ];
        self.dispatcher.visit(&mut visitors).await?;

        info!(specs = store.len(), "Leadership assumed");
        Ok(())
    }

    /// Pause every controller and free every stored group.
    ///
    /// Controllers are paused even when the store cannot be loaded; the load
    /// error is returned afterwards since groups were left unfreed.
    async fn on_lost_leadership(&self) -> Result<()> {
        info!(name = %self.config.name, "Lost leadership");
        let (store, load_failure) = match SpecStore::open(self.snapshot.as_ref()).await {
            Ok(store) => (store, None),
            Err(e) => (SpecStore::new(), Some(e)),
        };

        let store = &store;
        let mut visitors = [
            Visitor::controllers(|name, controller| {
                async move {
                    if let Err(e) = controller.pause(None).await {
                        warn!(plugin = %name, error = %e, "Pause failed");
                    }
                    Ok::<_, Error>(())
                }
                .boxed()
            }),
            Visitor::groups(move |name, group| {
                async move {
                    let interface = InterfaceSpec::group();
                    for record in store.records_for(&name, &interface) {
                        let id = GroupId::new(record.spec.metadata.name.clone());
                        if let Err(e) = group.free_group(&id).await {
                            warn!(plugin = %name, group = %id, error = %e, "Free failed");
                        }
                    }
                    Ok::<_, Error>(())
                }
                .boxed()
            }),
        ];
        self.dispatcher.visit(&mut visitors).await?;
        load_failure.map_or(Ok(()), Err)
    }
}
