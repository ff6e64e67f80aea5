//! Step and run states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a step was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "step")]
pub enum SkipReason {
    /// Precondition held: the host already has what the step would produce
    AlreadySatisfied,

    /// A failed step upstream (or a halting failure) prevented this one
    CausedBy(String),

    /// The run was cancelled before this step started
    Cancelled,
}

/// Lifecycle of a single step: `Pending -> Running -> terminal`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Skipped { reason: SkipReason },
    Failed { cancelled: bool },
}

impl StepStatus {
    pub fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    pub fn caused_by(step: impl Into<String>) -> Self {
        Self::Skipped {
            reason: SkipReason::CausedBy(step.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped { .. } | Self::Failed { .. })
    }

    /// Terminal and allows dependents to start
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Step id recorded as the cause of a skip, if any
    pub fn caused_by_step(&self) -> Option<&str> {
        match self {
            Self::Skipped {
                reason: SkipReason::CausedBy(step),
            } => Some(step),
            _ => None,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Skipped {
                reason: SkipReason::AlreadySatisfied,
            } => f.write_str("skipped (already satisfied)"),
            Self::Skipped {
                reason: SkipReason::CausedBy(step),
            } => write!(f, "skipped (caused by {})", step),
            Self::Skipped {
                reason: SkipReason::Cancelled,
            } => f.write_str("skipped (cancelled)"),
            Self::Failed { cancelled: true } => f.write_str("failed (cancelled)"),
            Self::Failed { cancelled: false } => f.write_str("failed"),
        }
    }
}

/// Global run lifecycle: `Initializing -> Executing -> {Completed, Aborted}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Initializing,
    Executing,
    Completed,
    Aborted,
}

/// Overall outcome of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    PartialFailure,
    Aborted,
}

/// Exit code when the plan or configuration cannot be loaded, so no step ran
pub const SETUP_FAILURE_EXIT: u8 = 3;

impl ReportStatus {
    /// Process exit code for this outcome
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Aborted => 1,
            Self::PartialFailure => 2,
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::PartialFailure => "partial failure",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let status = StepStatus::caused_by("clone-tool");
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(
            json,
            r#"{"status":"skipped","reason":{"reason":"caused_by","step":"clone-tool"}}"#
        );
        let parsed: StepStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.caused_by_step(), Some("clone-tool"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Succeeded.unblocks_dependents());
        assert!(StepStatus::skipped(SkipReason::AlreadySatisfied).unblocks_dependents());
        assert!(StepStatus::Failed { cancelled: false }.is_terminal());
        assert!(!StepStatus::Failed { cancelled: false }.unblocks_dependents());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ReportStatus::Success.exit_code(), 0);
        assert_eq!(ReportStatus::Aborted.exit_code(), 1);
        assert_eq!(ReportStatus::PartialFailure.exit_code(), 2);
        for status in [ReportStatus::Success, ReportStatus::Aborted, ReportStatus::PartialFailure] {
            assert_ne!(status.exit_code(), SETUP_FAILURE_EXIT);
        }
    }
}
