//! Shared fixtures: recording plugins and backend nodes.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use steward_engine::{
    Backend, Controller, Discovery, EngineConfig, GroupDescription, GroupId, GroupPlugin, GroupSpec,
    InMemorySnapshot, Leadership, LeadershipStatus, LocalConnector, ManualLeadership, Metadata, Object,
    Operation, Plan, PluginName, Result, Running, Snapshot, Spec, SpecStore, StaticDiscovery,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

/// Ordered log shared between plugins, possibly of several nodes.
#[derive(Debug, Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Controller that logs every call as `<label> <method> <name>`.
pub struct RecordingController {
    label: String,
    log: Log,
    delay: Duration,
    committed: Mutex<Vec<(Operation, Spec)>>,
}

impl RecordingController {
    pub fn new(label: &str, log: Log) -> Self {
        Self {
            label: label.to_string(),
            log,
            delay: Duration::ZERO,
            committed: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn commits(&self) -> Vec<(Operation, Spec)> {
        self.committed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn committed_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .commits()
            .into_iter()
            .map(|(_, spec)| spec.metadata.name)
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Controller for RecordingController {
    async fn plan(&self, _operation: Operation, spec: &Spec) -> Result<(Object, Plan)> {
        Ok((Object::new(spec.clone()), Plan::default()))
    }

    async fn commit(&self, operation: Operation, spec: &Spec) -> Result<Object> {
        let name = &spec.metadata.name;
        self.log.push(format!("{} enter {name}", self.label));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.committed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((operation, spec.clone()));
        self.log.push(format!("{} exit {name}", self.label));
        Ok(Object::new(spec.clone()))
    }

    async fn describe(&self, search: Option<&Metadata>) -> Result<Vec<Object>> {
        Ok(self
            .commits()
            .into_iter()
            .filter(|(op, spec)| {
                *op == Operation::Enforce && search.is_none_or(|s| spec.metadata.matches(s))
            })
            .map(|(_, spec)| Object::new(spec))
            .collect())
    }

    async fn specs(&self, _search: Option<&Metadata>) -> Result<Vec<Spec>> {
        Ok(Vec::new())
    }

    async fn pause(&self, _search: Option<&Metadata>) -> Result<Vec<Object>> {
        self.log.push(format!("{} pause", self.label));
        Ok(Vec::new())
    }

    async fn terminate(&self, search: Option<&Metadata>) -> Result<Vec<Object>> {
        let name = search.map_or("*", |s| s.name.as_str());
        self.log.push(format!("{} terminate {name}", self.label));
        Ok(Vec::new())
    }
}

/// Group plugin that logs every call as `<label> <method> <id>`.
pub struct RecordingGroup {
    label: String,
    log: Log,
    committed: Mutex<Vec<(GroupSpec, bool)>>,
}

impl RecordingGroup {
    pub fn new(label: &str, log: Log) -> Self {
        Self {
            label: label.to_string(),
            log,
            committed: Mutex::new(Vec::new()),
        }
    }

    pub fn commits(&self) -> Vec<(GroupSpec, bool)> {
        self.committed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl GroupPlugin for RecordingGroup {
    async fn commit_group(&self, spec: &GroupSpec, pretend: bool) -> Result<String> {
        self.log.push(format!("{} commit_group {}", self.label, spec.id));
        self.committed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((spec.clone(), pretend));
        Ok(format!("{} converging", spec.id))
    }

    async fn inspect_groups(&self) -> Result<Vec<GroupSpec>> {
        Ok(self.commits().into_iter().map(|(spec, _)| spec).collect())
    }

    async fn describe_group(&self, _id: &GroupId) -> Result<GroupDescription> {
        Ok(GroupDescription {
            instances: Vec::new(),
            converged: true,
        })
    }

    async fn destroy_group(&self, id: &GroupId) -> Result<()> {
        self.log.push(format!("{} destroy_group {id}", self.label));
        Ok(())
    }

    async fn free_group(&self, id: &GroupId) -> Result<()> {
        self.log.push(format!("{} free_group {id}", self.label));
        Ok(())
    }

    async fn size(&self, _id: &GroupId) -> Result<usize> {
        Ok(0)
    }

    async fn set_size(&self, id: &GroupId, size: usize) -> Result<()> {
        self.log.push(format!("{} set_size {id} {size}", self.label));
        Ok(())
    }
}

/// Route engine logs to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One engine process with its own plugins, sharing a snapshot.
pub struct Node {
    pub backend: Backend,
    pub leadership: Arc<ManualLeadership>,
    pub controller: Arc<RecordingController>,
    pub group: Arc<RecordingGroup>,
    pub discovery: Arc<StaticDiscovery>,
    pub running: Running,
}

impl Node {
    /// Build and start a node serving an `ingress` controller and a `group`
    /// plugin.
    pub async fn start(
        label: &str,
        snapshot: Arc<dyn Snapshot>,
        log: &Log,
    ) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        init_tracing();
        let controller = Arc::new(RecordingController::new(label, log.clone()));
        let group = Arc::new(RecordingGroup::new(label, log.clone()));

        let discovery = Arc::new(StaticDiscovery::new());
        discovery.register_local("ingress");
        discovery.register_local("group");
        discovery.register_local(label);

        let connector = LocalConnector::new();
        connector.register_controller("ingress", Arc::clone(&controller) as Arc<dyn Controller>);
        connector.register_group("group", Arc::clone(&group) as Arc<dyn GroupPlugin>);

        let leadership = Arc::new(ManualLeadership::new());
        let backend = Backend::builder()
            .with_config(EngineConfig::for_testing().with_name(label))
            .with_snapshot(snapshot)
            .with_leadership(Arc::clone(&leadership) as Arc<dyn Leadership>)
            .with_discovery(Arc::clone(&discovery) as Arc<dyn Discovery>)
            .with_connector(Arc::new(connector))
            .build()?;
        let running = backend.start().await?;

        Ok(Self {
            backend,
            leadership,
            controller,
            group,
            discovery,
            running,
        })
    }

    pub fn lead(&self) {
        self.leadership.set(LeadershipStatus::Leader);
    }

    pub fn follow(&self) {
        self.leadership.set(LeadershipStatus::NotLeader);
    }

    /// Wait until the consumer task reports `leader`.
    pub async fn until_leader(&self, leader: bool) -> TestResult {
        let mut watch = self.backend.leadership();
        tokio::time::timeout(WAIT, watch.wait_for(|l| *l == leader))
            .await
            .map_err(|_| format!("leadership never became {leader}"))??;
        Ok(())
    }

    pub async fn shutdown(mut self) -> TestResult {
        self.backend.stop().await;
        tokio::time::timeout(WAIT, self.running.wait())
            .await
            .map_err(|_| "backend did not stop")?;
        Ok(())
    }
}

/// The two-object store used by the leadership scenarios.
pub async fn seeded_snapshot() -> std::result::Result<Arc<InMemorySnapshot>, Box<dyn std::error::Error>> {
    let snapshot = Arc::new(InMemorySnapshot::new());
    let mut store = SpecStore::new();
    store.update_group_spec(
        &GroupSpec::new("managers", Some(json!("hello"))),
        PluginName::from("group"),
    );
    store.update_spec(elb("elb1"), PluginName::from("ingress"));
    store.store(snapshot.as_ref()).await?;
    Ok(snapshot)
}

pub fn elb(name: &str) -> Spec {
    Spec::new("ingress", name).with_properties(json!({"a": 1, "b": 2}))
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> TestResult {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("timed out waiting for {what}").into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
