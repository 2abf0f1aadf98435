//! Leader-gated reconciliation engine for discovered backend plugins.
//!
//! A cluster of peer processes elects a leader. The leader loads the
//! desired state from durable storage and drives every discovered plugin
//! toward it; followers stand by.
//!
//! # Key Concepts
//!
//! ## Desired state
//!
//! [`SpecStore`] indexes persisted [`Spec`]s by `(kind, name)`. It is
//! reloaded from its [`Snapshot`] at the start of every routine, so the
//! durable copy is always the source of truth.
//!
//! ## Leadership
//!
//! A [`Leadership`] detector reports raw statuses. [`LeadershipMonitor`]
//! turns them into edges: one notification per change, never one per report.
//!
//! ## Serialization
//!
//! Every mutation goes through one [`OperationQueue`]. A single consumer
//! task executes entries one at a time, and only while leader. Queued
//! adapters ([`QueuedController`], [`QueuedGroupPlugin`]) record a change in
//! the store and apply it to the plugin inside one queued operation.
//!
//! ## Reconciliation passes
//!
//! On becoming leader the [`Backend`] loads the store, waits on the
//! [`DependencyGate`] until every plugin the specs depend on is discoverable,
//! then commits each stored spec through its plugin. On losing leadership it
//! pauses every controller and frees every stored group.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use steward_engine::{
//!     Backend, EngineConfig, FileSnapshot, LocalConnector, ManualLeadership, StaticDiscovery,
//! };
//!
//! #[tokio::main]
//! async fn main() -> steward_engine::Result<()> {
//!     let leadership = Arc::new(ManualLeadership::new());
//!     let backend = Backend::builder()
//!         .with_config(EngineConfig::default())
//!         .with_snapshot(Arc::new(FileSnapshot::new("/var/lib/steward/specs.json")))
//!         .with_leadership(leadership.clone())
//!         .with_discovery(Arc::new(StaticDiscovery::new()))
//!         .with_connector(Arc::new(LocalConnector::new()))
//!         .build()?;
//!
//!     let mut running = backend.start().await?;
//!     leadership.set(steward_engine::LeadershipStatus::Leader);
//!     // ...
//!     backend.stop().await;
//!     running.wait().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod backend;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod leadership;
pub mod ledger;
pub mod plugin;
pub mod queue;
pub mod queued;
pub mod resolver;
pub mod store;
pub mod types;

// Re-export main types
pub use backend::{Backend, BackendBuilder, Running};
pub use config::EngineConfig;
pub use discovery::{DirectoryDiscovery, Discovery, Endpoint, StaticDiscovery};
pub use dispatch::{AdaptFn, PluginDispatcher, Visitor};
pub use error::{Error, Result};
pub use gate::{DependencyGate, Readiness};
pub use leadership::{
    FileLeadership, Leadership, LeadershipEvent, LeadershipMonitor, LeadershipStatus,
    ManualLeadership,
};
pub use ledger::{SnapshotLedger, SpecLedger};
pub use plugin::{Adapter, Capability, Connector, Controller, GroupPlugin, LocalConnector};
pub use queue::{Backlog, OperationQueue, QueueHandle, merge};
pub use queued::{QueuedController, QueuedGroupPlugin};
pub use resolver::{ResolveFn, ResolverRegistry, Runnable};
pub use store::{FileSnapshot, InMemorySnapshot, Key, Persisted, Record, Snapshot, SpecStore};
pub use types::{
    Dependency, GROUP_KIND, GroupDescription, GroupId, GroupSpec, Instance, InterfaceSpec,
    Metadata, Object, Operation, Plan, PluginName, Spec,
};
