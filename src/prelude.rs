//! Prelude module - common imports for embedding the engine
//!
//! Import this module to get all common types and traits:
//! ```rust
//! use steward::prelude::*;
//! ```

// Re-export result combinators
pub use steward_core::ResultExt;

// Re-export error types
pub use steward_engine::{Error, Result};

// Re-export the engine and its collaborators
pub use steward_engine::{
    Backend, BackendBuilder, Connector, Controller, Discovery, EngineConfig, GroupPlugin,
    Leadership, LeadershipStatus, Running, Snapshot,
};

// Re-export domain types
pub use steward_engine::{
    GroupDescription, GroupId, GroupSpec, Metadata, Object, Operation, Plan, PluginName, Spec,
};
