//! Pipeline scheduling and orchestration for Gauntlet CI.
//!
//! [`TriggerMatcher`] decides whether an event starts a run,
//! [`MatrixExpander`] turns each job into its concrete combinations, and
//! [`Scheduler`] executes the resulting job runs concurrently.

pub mod matrix;
pub mod scheduler;
pub mod triggers;

pub use matrix::{MatrixExpander, MatrixJob};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use triggers::{TriggerEvent, TriggerMatcher};
