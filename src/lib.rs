#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # Steward
//!
//! Leader-gated reconciliation of desired state across discovered backend
//! plugins.
//!
//! This library re-exports the Steward workspace crates for convenience.

pub use steward_core;
pub use steward_engine;

pub mod prelude;
