//! Error taxonomy for plan construction and step execution.
//!
//! `InvalidPlanError` is the only error that stops a run before any step
//! executes. Every `StepError` is converted into a terminal step state by
//! the orchestrator and surfaces in the report with its step id.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plan construction failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPlanError {
    #[error("Plan '{plan}' has no steps")]
    Empty { plan: String },

    #[error("Step at position {index} has an empty id")]
    EmptyId { index: usize },

    #[error("Step id '{id}' is declared more than once")]
    DuplicateStep { id: String },

    #[error("Step '{step}' depends on unknown step '{missing}'")]
    UnknownDependency { step: String, missing: String },

    #[error("Step '{step}' depends on itself")]
    SelfDependency { step: String },

    #[error("Dependency cycle between steps: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },
}

impl InvalidPlanError {
    /// Step ids named by this error
    pub fn step_ids(&self) -> Vec<&str> {
        match self {
            Self::Empty { .. } | Self::EmptyId { .. } => Vec::new(),
            Self::DuplicateStep { id } => vec![id.as_str()],
            Self::UnknownDependency { step, .. } | Self::SelfDependency { step } => {
                vec![step.as_str()]
            }
            Self::Cycle { steps } => steps.iter().map(String::as_str).collect(),
        }
    }
}

/// Step-scoped execution errors
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepError {
    /// The precondition check itself errored (distinct from "not satisfied")
    #[error("Step '{step}': precondition check failed: {message}")]
    PreconditionCheck { step: String, message: String },

    /// The collaborator failed or returned non-zero
    #[error("Step '{step}' attempt {attempt}: action failed: {message}")]
    ActionExecution {
        step: String,
        attempt: u32,
        message: String,
        stderr: String,
    },

    /// The action reported success but verification did not hold
    #[error("Step '{step}' attempt {attempt}: verification failed: {message}")]
    Verification {
        step: String,
        attempt: u32,
        message: String,
    },

    #[error("Step '{step}' attempt {attempt}: timed out after {limit_ms}ms")]
    Timeout {
        step: String,
        attempt: u32,
        limit_ms: u64,
        stderr: String,
    },

    #[error("Step '{step}' attempt {attempt}: cancelled")]
    Cancelled { step: String, attempt: u32 },
}

impl StepError {
    pub fn timeout(step: &str, attempt: u32, limit: Duration) -> Self {
        Self::Timeout {
            step: step.to_string(),
            attempt,
            limit_ms: limit.as_millis() as u64,
            stderr: String::new(),
        }
    }

    /// Attach collaborator output to errors that carry it
    pub fn with_stderr(mut self, output: impl Into<String>) -> Self {
        match self {
            Self::ActionExecution { ref mut stderr, .. } | Self::Timeout { ref mut stderr, .. } => {
                *stderr = output.into();
            }
            _ => {}
        }
        self
    }

    /// Id of the step this error originated from
    pub fn step_id(&self) -> &str {
        match self {
            Self::PreconditionCheck { step, .. }
            | Self::ActionExecution { step, .. }
            | Self::Verification { step, .. }
            | Self::Timeout { step, .. }
            | Self::Cancelled { step, .. } => step,
        }
    }

    /// Captured stderr of the failing collaborator, if any
    pub fn stderr(&self) -> &str {
        match self {
            Self::ActionExecution { stderr, .. } | Self::Timeout { stderr, .. } => stderr,
            _ => "",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
