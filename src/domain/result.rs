//! Per-step execution results.

use serde::{Deserialize, Serialize};

use crate::core::error::StepError;

use super::status::{SkipReason, StepStatus};

/// Outcome of one step in one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: String,

    pub status: StepStatus,

    /// Number of times the action was invoked (0 when skipped)
    pub attempts: u32,

    /// Wall time in milliseconds, including retry delays
    pub duration_ms: u64,

    /// Tail of the collaborator's stdout from the last attempt
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl ExecutionResult {
    pub fn succeeded(step_id: impl Into<String>, attempts: u32, duration_ms: u64, output: String) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            attempts,
            duration_ms,
            output,
            error: None,
        }
    }

    pub fn skipped(step_id: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::skipped(reason),
            attempts: 0,
            duration_ms: 0,
            output: String::new(),
            error: None,
        }
    }

    pub fn failed(step_id: impl Into<String>, attempts: u32, duration_ms: u64, error: StepError) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed {
                cancelled: error.is_cancelled(),
            },
            attempts,
            duration_ms,
            output: String::new(),
            error: Some(error),
        }
    }

    /// Captured stderr of the failure, if any
    pub fn stderr(&self) -> &str {
        self.error.as_ref().map(StepError::stderr).unwrap_or("")
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.status, StepStatus::Failed { cancelled: true })
    }
}
