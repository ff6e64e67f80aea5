//! Core orchestration logic.
//!
//! This module contains:
//! - Step: step definitions, retry and failure policies
//! - Plan: validated, topologically ordered step graphs
//! - StepRunner: single-step execution
//! - Resources: class pools and lock tags
//! - Orchestrator: main execution engine
//! - Checks: built-in host checks

pub mod checks;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod resources;
pub mod runner;
pub mod step;

// Re-export commonly used types
pub use checks::Check;
pub use error::{InvalidPlanError, StepError};
pub use orchestrator::Orchestrator;
pub use plan::Plan;
pub use resources::{ResourceLimits, Resources};
pub use runner::StepRunner;
pub use step::{
    Backoff, ConcurrencyClass, FailurePolicy, FnAction, FnCheck, HostCheck, RetryPolicy, Step,
    StepAction,
};
