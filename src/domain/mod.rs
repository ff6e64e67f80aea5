//! Domain types for the provisioning orchestrator.
//!
//! - Status: step and run lifecycles
//! - Result: per-step execution results
//! - Report: aggregated run output and dry-run forecasts

pub mod report;
pub mod result;
pub mod status;

// Re-export commonly used types
pub use report::{Forecast, Prediction, Report, StepForecast};
pub use result::ExecutionResult;
pub use status::{ReportStatus, RunState, SkipReason, StepStatus, SETUP_FAILURE_EXIT};
