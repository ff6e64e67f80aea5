//! provision - Declarative, idempotent host provisioning
//!
//! A host is described by a plan of steps. Each step pairs an action on an
//! external tool (package manager, git, make/cmake, openssl, file
//! operations, downloads) with checks that let a second run skip work
//! already done.
//!
//! # Architecture
//!
//! - Plans are validated and topologically ordered before anything runs
//! - Steps run through a single runner that applies precondition, retry,
//!   timeout, verification and cancellation uniformly
//! - Failures become terminal step states governed by per-step policies;
//!   a run always ends with a report
//!
//! # Modules
//!
//! - `adapters`: External tool integrations behind narrow traits
//! - `core`: Plan, StepRunner, Orchestrator, resource pools, host checks
//! - `domain`: Step statuses, results, reports
//! - `manifest`: YAML plan documents
//! - `context`: Invoking user, install root and toolbox
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Forecast what a plan would do
//! provision apply --plan toolkit --dry-run
//!
//! # Apply it, four steps at a time
//! sudo provision apply --plan toolkit --jobs 4
//!
//! # Check a plan document
//! provision validate --plan ./plans/toolkit.yaml
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod context;
pub mod core;
pub mod domain;
pub mod manifest;

// Re-export main types at crate root for convenience
pub use context::{HostContext, InvokingUser, Toolbox};
pub use self::core::{Orchestrator, Plan, Step, StepRunner};
pub use domain::{ExecutionResult, Forecast, Report, ReportStatus, RunState, SkipReason, StepStatus};
pub use manifest::PlanDocument;
