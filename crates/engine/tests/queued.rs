//! Queued adapter tests.
//!
//! These drive `QueuedController` and `QueuedGroupPlugin` against a bare
//! operation queue with a hand-rolled consumer, so ordering can be checked
//! without leadership in the picture.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use common::{Log, RecordingController, RecordingGroup, TestResult, WAIT, elb};
use steward_engine::{
    Controller, Error, GroupId, GroupPlugin, GroupSpec, InMemorySnapshot, Metadata, Operation,
    OperationQueue, PluginName, QueuedController, QueuedGroupPlugin, Result, SnapshotLedger, Spec,
    SpecLedger, SpecStore,
};

/// Snapshot ledger that refuses to remove one named spec.
struct StickyLedger {
    inner: SnapshotLedger,
    sticky: String,
}

#[async_trait]
impl SpecLedger for StickyLedger {
    async fn find(&self, search: Option<&Metadata>, handler: &PluginName) -> Result<Vec<Spec>> {
        self.inner.find(search, handler).await
    }

    async fn update(&self, spec: &Spec, handler: &PluginName) -> Result<()> {
        self.inner.update(spec, handler).await
    }

    async fn remove(&self, kind: &str, metadata: &Metadata) -> Result<()> {
        if metadata.name == self.sticky {
            return Err(Error::snapshot("save", "disk full"));
        }
        self.inner.remove(kind, metadata).await
    }

    async fn group_specs(&self, handler: &PluginName) -> Result<Vec<GroupSpec>> {
        self.inner.group_specs(handler).await
    }

    async fn update_group(&self, group: &GroupSpec, handler: &PluginName) -> Result<()> {
        self.inner.update_group(group, handler).await
    }

    async fn remove_group(&self, id: &GroupId) -> Result<()> {
        self.inner.remove_group(id).await
    }
}

struct Harness {
    queue: Arc<OperationQueue>,
    snapshot: Arc<InMemorySnapshot>,
    ledger: Arc<dyn SpecLedger>,
    stop: watch::Sender<bool>,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(|snapshot| Arc::new(SnapshotLedger::new(snapshot)))
    }

    fn start_with(ledger: impl FnOnce(Arc<InMemorySnapshot>) -> Arc<dyn SpecLedger>) -> Self {
        let (stop, done) = watch::channel(false);
        let queue = Arc::new(OperationQueue::new(16, done));
        let mut backlog = queue.take_backlog().expect("backlog taken once");
        tokio::spawn(async move {
            while let Some(entry) = backlog.recv().await {
                entry.execute().await;
            }
        });

        let snapshot = Arc::new(InMemorySnapshot::new());
        let ledger = ledger(Arc::clone(&snapshot));
        Self {
            queue,
            snapshot,
            ledger,
            stop,
        }
    }

    fn controller(&self, inner: Arc<RecordingController>) -> QueuedController {
        QueuedController::new(
            PluginName::from("ingress"),
            inner,
            Arc::clone(&self.ledger),
            self.queue.producer(),
        )
    }

    fn group(&self, inner: Arc<RecordingGroup>) -> QueuedGroupPlugin {
        QueuedGroupPlugin::new(
            PluginName::from("group"),
            inner,
            Arc::clone(&self.ledger),
            self.queue.producer(),
        )
    }

    async fn store(&self) -> SpecStore {
        SpecStore::open(self.snapshot.as_ref()).await.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.queue.close();
    }
}

/// GIVEN: a slow controller behind one queue, reached through four adapters
/// WHEN: every adapter commits concurrently from its own task
/// THEN: no two commits overlap and every spec is persisted
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commits_never_interleave() -> TestResult {
    let harness = Harness::start();
    let log = Log::default();
    let raw = Arc::new(RecordingController::new("a", log.clone()).with_delay(Duration::from_millis(5)));

    let mut tasks = Vec::new();
    for adapter in 0..4 {
        let controller = Arc::new(harness.controller(Arc::clone(&raw)));
        tasks.push(tokio::spawn(async move {
            for n in 0..5 {
                let spec = elb(&format!("elb-{adapter}-{n}"));
                controller.commit(Operation::Enforce, &spec).await?;
            }
            Ok::<_, steward_engine::Error>(())
        }));
    }
    for task in tasks {
        tokio::time::timeout(WAIT, task).await???;
    }

    let entries = log.entries();
    assert_eq!(entries.len(), 40);
    for pair in entries.chunks(2) {
        let entered = pair[0].strip_prefix("a enter ").expect("enter first");
        let exited = pair[1].strip_prefix("a exit ").expect("exit second");
        assert_eq!(entered, exited, "commit of {entered} was interleaved");
    }
    assert_eq!(harness.store().await.len(), 20);
    Ok(())
}

/// GIVEN: a controller that has already enforced `elb1`
/// WHEN: planning `elb1` and then `elb2`
/// THEN: the first plan updates the existing object and the second creates one
#[tokio::test]
async fn plan_reports_existing_objects() -> TestResult {
    let harness = Harness::start();
    let raw = Arc::new(RecordingController::new("a", Log::default()));
    let controller = harness.controller(Arc::clone(&raw));

    controller.commit(Operation::Enforce, &elb("elb1")).await?;

    let (object, plan) = controller.plan(Operation::Enforce, &elb("elb1")).await?;
    assert_eq!(object.spec.metadata.name, "elb1");
    assert_eq!(plan.message, vec!["update-existing".to_string()]);

    let (object, plan) = controller.plan(Operation::Enforce, &elb("elb2")).await?;
    assert_eq!(object.spec.metadata.name, "elb2");
    assert!(object.state.is_none());
    assert_eq!(plan.message, vec!["create-new".to_string()]);
    Ok(())
}

/// GIVEN: an enforced `elb1`
/// WHEN: planning its destruction
/// THEN: the plan comes from the plugin rather than from its description
#[tokio::test]
async fn destroy_plan_comes_from_the_plugin() -> TestResult {
    let harness = Harness::start();
    let raw = Arc::new(RecordingController::new("a", Log::default()));
    let controller = harness.controller(Arc::clone(&raw));

    controller.commit(Operation::Enforce, &elb("elb1")).await?;

    let (object, plan) = controller.plan(Operation::Destroy, &elb("elb1")).await?;
    assert_eq!(object.spec.metadata.name, "elb1");
    assert!(plan.message.is_empty(), "{:?}", plan.message);
    Ok(())
}

/// GIVEN: two enforced specs
/// WHEN: destroying one of them
/// THEN: only the other remains in the ledger and the plugin saw both commits
#[tokio::test]
async fn destroy_forgets_the_spec() -> TestResult {
    let harness = Harness::start();
    let raw = Arc::new(RecordingController::new("a", Log::default()));
    let controller = harness.controller(Arc::clone(&raw));

    controller.commit(Operation::Enforce, &elb("elb1")).await?;
    controller.commit(Operation::Enforce, &elb("elb2")).await?;
    controller.commit(Operation::Destroy, &elb("elb1")).await?;

    let specs = controller.specs(None).await?;
    let names: Vec<_> = specs.iter().map(|s| s.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["elb2"]);
    assert_eq!(raw.commits().len(), 3);
    assert_eq!(raw.commits()[2].0, Operation::Destroy);
    Ok(())
}

/// GIVEN: a spec without a kind
/// WHEN: committing it
/// THEN: the commit is rejected before it reaches the queue or the plugin
#[tokio::test]
async fn invalid_spec_is_rejected() -> TestResult {
    let harness = Harness::start();
    let raw = Arc::new(RecordingController::new("a", Log::default()));
    let controller = harness.controller(Arc::clone(&raw));

    let result = controller
        .commit(Operation::Enforce, &steward_engine::Spec::new("", "nameless"))
        .await;
    assert!(matches!(result, Err(steward_engine::Error::InvalidSpec { .. })));
    assert!(raw.commits().is_empty());
    assert!(harness.store().await.is_empty());
    Ok(())
}

/// GIVEN: three enforced specs, one tagged for the blue project
/// WHEN: pausing with a search matching the blue tag, then terminating everything
/// THEN: each pause removes exactly the matching specs and reaches the plugin
#[tokio::test]
async fn pause_releases_matching_specs() -> TestResult {
    let harness = Harness::start();
    let log = Log::default();
    let raw = Arc::new(RecordingController::new("a", log.clone()));
    let controller = harness.controller(Arc::clone(&raw));

    controller
        .commit(Operation::Enforce, &elb("elb1").with_tag("project", "blue"))
        .await?;
    controller.commit(Operation::Enforce, &elb("elb2")).await?;
    controller.commit(Operation::Enforce, &elb("elb3")).await?;

    let blue = Metadata::default().with_tag("project", "blue");
    controller.pause(Some(&blue)).await?;
    assert_eq!(harness.store().await.len(), 2);
    assert_eq!(log.count("a pause"), 1);

    controller.terminate(None).await?;
    assert!(harness.store().await.is_empty());
    assert_eq!(log.count("a terminate"), 1);
    Ok(())
}

/// GIVEN: three enforced specs and a ledger that cannot remove `elb2`
/// WHEN: pausing and then terminating everything
/// THEN: the other specs are removed, both calls still reach the plugin,
///       and `elb2` stays recorded
#[tokio::test]
async fn release_survives_a_failed_removal() -> TestResult {
    let harness = Harness::start_with(|snapshot| {
        Arc::new(StickyLedger {
            inner: SnapshotLedger::new(snapshot),
            sticky: "elb2".to_string(),
        })
    });
    let log = Log::default();
    let controller = harness.controller(Arc::new(RecordingController::new("a", log.clone())));

    for name in ["elb1", "elb2", "elb3"] {
        controller.commit(Operation::Enforce, &elb(name)).await?;
    }

    controller.pause(None).await?;
    assert_eq!(log.count("a pause"), 1);
    let left: Vec<String> = harness
        .store()
        .await
        .specs()
        .into_iter()
        .map(|spec| spec.metadata.name)
        .collect();
    assert_eq!(left, vec!["elb2".to_string()]);

    controller.terminate(None).await?;
    assert_eq!(log.count("a terminate"), 1);
    assert_eq!(harness.store().await.len(), 1);
    Ok(())
}

/// GIVEN: a queued group plugin
/// WHEN: committing once in pretend mode and once for real
/// THEN: both calls reach the plugin but only the real one is recorded
#[tokio::test]
async fn pretend_group_commit_is_not_recorded() -> TestResult {
    let harness = Harness::start();
    let raw = Arc::new(RecordingGroup::new("a", Log::default()));
    let group = harness.group(Arc::clone(&raw));

    let spec = GroupSpec::new("workers", Some(json!({"Allocation": {"Size": 3}})));
    let message = group.commit_group(&spec, true).await?;
    assert_eq!(message, "workers converging");
    assert!(group.inspect_groups().await?.is_empty());

    group.commit_group(&spec, false).await?;
    assert_eq!(group.inspect_groups().await?, vec![spec.clone()]);
    assert_eq!(raw.commits(), vec![(spec.clone(), true), (spec, false)]);
    Ok(())
}

/// GIVEN: two recorded groups
/// WHEN: freeing one and destroying the other
/// THEN: both leave the ledger and both calls reach the plugin
#[tokio::test]
async fn free_and_destroy_forget_groups() -> TestResult {
    let harness = Harness::start();
    let log = Log::default();
    let raw = Arc::new(RecordingGroup::new("a", log.clone()));
    let group = harness.group(Arc::clone(&raw));

    group.commit_group(&GroupSpec::new("workers", None), false).await?;
    group.commit_group(&GroupSpec::new("managers", None), false).await?;

    group.free_group(&GroupId::from("workers")).await?;
    let remaining = harness.ledger.group_specs(&PluginName::from("group")).await?;
    assert_eq!(remaining, vec![GroupSpec::new("managers", None)]);

    group.destroy_group(&GroupId::from("managers")).await?;
    assert!(harness.store().await.is_empty());

    assert!(log.position("a free_group workers").is_some());
    assert!(log.position("a destroy_group managers").is_some());
    Ok(())
}

/// GIVEN: a queued group plugin
/// WHEN: resizing a group
/// THEN: the call is forwarded and the ledger is untouched
#[tokio::test]
async fn set_size_is_forwarded() -> TestResult {
    let harness = Harness::start();
    let log = Log::default();
    let group = harness.group(Arc::new(RecordingGroup::new("a", log.clone())));

    group.set_size(&GroupId::from("workers"), 5).await?;
    assert_eq!(log.entries(), vec!["a set_size workers 5".to_string()]);
    assert_eq!(group.size(&GroupId::from("workers")).await?, 0);
    assert!(harness.store().await.is_empty());
    Ok(())
}
