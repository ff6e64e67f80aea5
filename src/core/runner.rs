//! Single-step execution with idempotence, retry and verification.
//!
//! The runner itself never touches the host: every side effect comes from
//! the step's action. A satisfied precondition returns `Skipped` before
//! anything else happens, which is what makes re-running a plan safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{tail, AdapterError, AdapterResult, Outcome};
use crate::context::HostContext;
use crate::domain::{ExecutionResult, Prediction, SkipReason, StepForecast};

use super::error::StepError;
use super::resources::Resources;
use super::step::Step;

/// Lines of collaborator output kept in results
const OUTPUT_TAIL_LINES: usize = 20;

/// How long a timed-out or cancelled action gets to clean up
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Result of a single action attempt
enum Attempt {
    Finished(Outcome),
    AdapterFailed(AdapterError),
    TimedOut { limit: Duration, stderr: String },
    Cancelled,
}

impl From<AdapterResult> for Attempt {
    fn from(result: AdapterResult) -> Self {
        match result {
            Ok(outcome) => Self::Finished(outcome),
            Err(e) if e.is_cancelled() => Self::Cancelled,
            Err(e) => Self::AdapterFailed(e),
        }
    }
}

/// Executes one step against the host
#[derive(Clone)]
pub struct StepRunner {
    ctx: Arc<HostContext>,
    resources: Option<Arc<Resources>>,
}

impl StepRunner {
    pub fn new(ctx: Arc<HostContext>) -> Self {
        Self { ctx, resources: None }
    }

    /// Hold lock tags for each step and a class permit per action attempt
    pub fn with_resources(mut self, resources: Arc<Resources>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    /// Run a step to a terminal state
    #[instrument(skip_all, fields(step = %step.id))]
    pub async fn run(&self, step: &Step, cancel: &CancellationToken) -> ExecutionResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        // Checks and action must observe the same state of the tagged paths
        let _locks = match self.resources {
            Some(ref resources) => tokio::select! {
                guard = resources.lock_tags(step) => Some(guard),
                _ = cancel.cancelled() => return self.cancelled(step, 0, elapsed_ms()),
            },
            None => None,
        };

        if let Some(ref precondition) = step.precondition {
            match precondition.check(&self.ctx).await {
                Ok(true) => {
                    info!(check = %precondition.describe(), "Precondition satisfied, skipping");
                    return ExecutionResult::skipped(&step.id, SkipReason::AlreadySatisfied);
                }
                Ok(false) => debug!(check = %precondition.describe(), "Precondition not satisfied"),
                Err(e) => {
                    let error = StepError::PreconditionCheck {
                        step: step.id.clone(),
                        message: format!("{:#}", e),
                    };
                    warn!(%error, "Precondition check errored");
                    return ExecutionResult::failed(&step.id, 0, elapsed_ms(), error);
                }
            }
        }

        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return self.cancelled(step, attempt, elapsed_ms());
            }

            info!(attempt, action = %step.action.describe(), "Running step");

            let error = match self.attempt(step, cancel).await {
                Attempt::Finished(outcome) if outcome.success => {
                    let output = tail(&outcome.stdout, OUTPUT_TAIL_LINES);
                    return match self.verify_after_success(step, attempt).await {
                        Ok(()) => {
                            info!(attempt, duration_ms = elapsed_ms(), "Step succeeded");
                            ExecutionResult::succeeded(&step.id, attempt, elapsed_ms(), output)
                        }
                        Err(error) => {
                            warn!(%error, "Verification failed after successful action");
                            ExecutionResult::failed(&step.id, attempt, elapsed_ms(), error)
                        }
                    };
                }
                Attempt::Finished(outcome) => StepError::ActionExecution {
                    step: step.id.clone(),
                    attempt,
                    message: format!("{} {}", step.action.describe(), outcome.describe_exit()),
                    stderr: tail(&outcome.stderr, OUTPUT_TAIL_LINES),
                },
                Attempt::AdapterFailed(e) => StepError::ActionExecution {
                    step: step.id.clone(),
                    attempt,
                    message: e.to_string(),
                    stderr: String::new(),
                },
                Attempt::TimedOut { limit, stderr } => {
                    let error = StepError::timeout(&step.id, attempt, limit)
                        .with_stderr(tail(&stderr, OUTPUT_TAIL_LINES));
                    warn!(%error, "Step timed out");
                    return ExecutionResult::failed(&step.id, attempt, elapsed_ms(), error);
                }
                Attempt::Cancelled => return self.cancelled(step, attempt, elapsed_ms()),
            };

            // Verification confirms success independently of the exit status
            if let Some(ref verify) = step.verify {
                if let Ok(true) = verify.check(&self.ctx).await {
                    warn!(%error, check = %verify.describe(), "Action reported failure but verification holds");
                    return ExecutionResult::succeeded(&step.id, attempt, elapsed_ms(), String::new());
                }
            }

            if !step.retry.should_retry(attempt) {
                warn!(%error, attempts = attempt, "Step failed permanently");
                return ExecutionResult::failed(&step.id, attempt, elapsed_ms(), error);
            }

            let delay = step.retry.delay_after(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Step failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return self.cancelled(step, attempt, elapsed_ms()),
            }
        }
    }

    /// One action invocation under a class permit and the step timeout
    async fn attempt(&self, step: &Step, cancel: &CancellationToken) -> Attempt {
        let _permit = match self.resources {
            Some(ref resources) => tokio::select! {
                guard = resources.permit(step) => match guard {
                    Ok(guard) => Some(guard),
                    Err(e) => return Attempt::AdapterFailed(AdapterError::from(e)),
                },
                _ = cancel.cancelled() => return Attempt::Cancelled,
            },
            None => None,
        };

        let token = cancel.child_token();
        let action = step.action.run(&self.ctx, &token);
        tokio::pin!(action);

        let deadline = async {
            match step.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let interrupted = tokio::select! {
            result = &mut action => return Attempt::from(result),
            _ = deadline => {
                token.cancel();
                Attempt::TimedOut {
                    limit: step.timeout.unwrap_or_default(),
                    stderr: String::new(),
                }
            }
            _ = cancel.cancelled() => Attempt::Cancelled,
        };

        // The child token is cancelled by now; give the action time to clean up
        let stderr = match tokio::time::timeout(CANCEL_GRACE, action).await {
            Ok(Ok(outcome)) => outcome.stderr,
            Ok(Err(e)) => e.stderr().to_string(),
            Err(_) => {
                warn!(step = %step.id, "Action did not stop within grace period");
                String::new()
            }
        };

        match interrupted {
            Attempt::TimedOut { limit, .. } => Attempt::TimedOut { limit, stderr },
            other => other,
        }
    }

    async fn verify_after_success(&self, step: &Step, attempt: u32) -> Result<(), StepError> {
        let Some(ref verify) = step.verify else {
            return Ok(());
        };

        match verify.check(&self.ctx).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(StepError::Verification {
                step: step.id.clone(),
                attempt,
                message: format!("'{}' does not hold", verify.describe()),
            }),
            Err(e) => Err(StepError::Verification {
                step: step.id.clone(),
                attempt,
                message: format!("check '{}' errored: {:#}", verify.describe(), e),
            }),
        }
    }

    fn cancelled(&self, step: &Step, attempt: u32, duration_ms: u64) -> ExecutionResult {
        warn!(attempt, "Step cancelled");
        ExecutionResult::failed(
            &step.id,
            attempt,
            duration_ms,
            StepError::Cancelled {
                step: step.id.clone(),
                attempt,
            },
        )
    }

    /// Evaluate a step's checks without running its action
    #[instrument(skip_all, fields(step = %step.id))]
    pub async fn forecast(&self, step: &Step) -> StepForecast {
        let action = step.action.describe();

        let precondition = match step.precondition {
            Some(ref check) => match check.check(&self.ctx).await {
                Ok(satisfied) => satisfied,
                Err(e) => {
                    return StepForecast {
                        step_id: step.id.clone(),
                        action,
                        prediction: Prediction::CheckFailed {
                            message: format!("precondition '{}': {:#}", check.describe(), e),
                        },
                    }
                }
            },
            None => false,
        };

        let verified = match step.verify {
            Some(ref check) => match check.check(&self.ctx).await {
                Ok(holds) => Some(holds),
                Err(e) if !precondition => {
                    return StepForecast {
                        step_id: step.id.clone(),
                        action,
                        prediction: Prediction::CheckFailed {
                            message: format!("verify '{}': {:#}", check.describe(), e),
                        },
                    }
                }
                Err(_) => None,
            },
            None => None,
        };

        let prediction = if precondition {
            Prediction::WouldSkip
        } else {
            Prediction::WouldRun {
                already_verified: verified,
            }
        };

        StepForecast {
            step_id: step.id.clone(),
            action,
            prediction,
        }
    }
}
