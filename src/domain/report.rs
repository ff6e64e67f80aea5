//! Run reports and dry-run forecasts.
//!
//! A report is finalized when plan traversal ends and handed back to the
//! caller; nothing is persisted between runs.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapters::tail;

use super::result::ExecutionResult;
use super::status::{ReportStatus, RunState, StepStatus};

/// Number of stderr lines shown for the causing step
pub const STDERR_TAIL_LINES: usize = 20;

/// Aggregated results of one plan run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,

    pub plan_name: String,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    pub run_state: RunState,

    pub status: ReportStatus,

    /// Step whose failure halted or degraded the run
    pub halted_by: Option<String>,

    /// Results in plan execution order
    pub results: Vec<ExecutionResult>,
}

impl Report {
    /// Look up a step's result
    pub fn result(&self, step_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    /// Final status of a step
    pub fn status_of(&self, step_id: &str) -> Option<&StepStatus> {
        self.result(step_id).map(|r| &r.status)
    }

    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }

    pub fn count(&self, predicate: impl Fn(&StepStatus) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(&r.status)).count()
    }

    /// Human-readable rendering: one line per step, then the cause on failure
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let width = self
            .results
            .iter()
            .map(|r| r.step_id.len())
            .max()
            .unwrap_or(0);

        for result in &self.results {
            let attempts = if result.attempts > 1 {
                format!(" [{} attempts]", result.attempts)
            } else {
                String::new()
            };
            let _ = writeln!(
                out,
                "  {:<width$}  {}{} ({}ms)",
                result.step_id,
                result.status,
                attempts,
                result.duration_ms,
                width = width
            );
        }

        let _ = writeln!(
            out,
            "\n[Plan '{}' {}: {} succeeded, {} skipped, {} failed]",
            self.plan_name,
            self.status,
            self.count(|s| matches!(s, StepStatus::Succeeded)),
            self.count(|s| matches!(s, StepStatus::Skipped { .. })),
            self.count(StepStatus::is_failed),
        );

        if self.status != ReportStatus::Success {
            for failed in self.results.iter().filter(|r| r.status.is_failed()) {
                let _ = writeln!(out, "\nCaused by step '{}':", failed.step_id);
                if let Some(ref error) = failed.error {
                    let _ = writeln!(out, "  {}", error);
                }
                let stderr = tail(failed.stderr(), STDERR_TAIL_LINES);
                if !stderr.is_empty() {
                    for line in stderr.lines() {
                        let _ = writeln!(out, "  | {}", line);
                    }
                }
            }
        }

        out
    }
}

/// Predicted outcome of a step in a dry run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "prediction")]
pub enum Prediction {
    /// Precondition holds; the step would be skipped
    WouldSkip,

    /// The action would run; `already_verified` tells whether verify holds now
    WouldRun { already_verified: Option<bool> },

    /// A check could not be evaluated
    CheckFailed { message: String },
}

/// Dry-run forecast for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepForecast {
    pub step_id: String,
    pub action: String,
    pub prediction: Prediction,
}

/// Dry-run output for a whole plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub plan_name: String,
    pub steps: Vec<StepForecast>,
}

impl Forecast {
    pub fn get(&self, step_id: &str) -> Option<&Prediction> {
        self.steps
            .iter()
            .find(|s| s.step_id == step_id)
            .map(|s| &s.prediction)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let width = self.steps.iter().map(|s| s.step_id.len()).max().unwrap_or(0);

        for step in &self.steps {
            let predicted = match &step.prediction {
                Prediction::WouldSkip => "would skip (already satisfied)".to_string(),
                Prediction::WouldRun {
                    already_verified: Some(true),
                } => format!("would run: {} (verification already passes)", step.action),
                Prediction::WouldRun { .. } => format!("would run: {}", step.action),
                Prediction::CheckFailed { message } => format!("check error: {}", message),
            };
            let _ = writeln!(out, "  {:<width$}  {}", step.step_id, predicted, width = width);
        }

        let _ = writeln!(out, "\n[Dry run of plan '{}': no actions executed]", self.plan_name);
        out
    }
}
