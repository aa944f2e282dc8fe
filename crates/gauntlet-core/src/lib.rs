//! Gauntlet CI Core
//!
//! Core domain types and error handling for Gauntlet CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: pipeline definitions, job runs and their
//! state machine, and variable interpolation.

pub mod error;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod run;

pub use error::{Error, ErrorKind, Result};
pub use ids::*;
