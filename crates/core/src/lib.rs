//! # Steward Core
//!
//! Errors, result combinators and document helpers shared by the Steward
//! workspace crates.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod document;
pub mod error;
pub mod result;

pub use error::Error;
pub use result::{Result, ResultExt};
