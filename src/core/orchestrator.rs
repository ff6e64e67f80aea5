//! Main orchestrator for plan execution.
//!
//! Walks the plan in topological order, hands ready steps to the
//! [`StepRunner`], and turns step failures into terminal states according
//! to each step's [`FailurePolicy`]. Step errors never escape `run`; the
//! caller always gets a finalized [`Report`].

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::context::HostContext;
use crate::domain::{
    ExecutionResult, Forecast, Report, ReportStatus, RunState, SkipReason, StepStatus,
};

use super::error::StepError;
use super::plan::Plan;
use super::resources::{ResourceLimits, Resources};
use super::runner::StepRunner;
use super::step::FailurePolicy;

/// Plan orchestrator
pub struct Orchestrator {
    ctx: Arc<HostContext>,
    /// Maximum steps in flight at once; 1 means strictly sequential
    jobs: usize,
    limits: ResourceLimits,
    cancel: CancellationToken,
}

/// Mutable bookkeeping for one run
struct RunLedger {
    statuses: Vec<StepStatus>,
    results: Vec<Option<ExecutionResult>>,
    /// Step whose Abort/SkipRemaining policy stopped scheduling
    halted_by: Option<(String, FailurePolicy)>,
    first_failure: Option<String>,
}

impl RunLedger {
    fn new(len: usize) -> Self {
        Self {
            statuses: vec![StepStatus::Pending; len],
            results: vec![None; len],
            halted_by: None,
            first_failure: None,
        }
    }

    fn skip(&mut self, index: usize, step_id: &str, reason: SkipReason) {
        self.statuses[index] = StepStatus::skipped(reason.clone());
        self.results[index] = Some(ExecutionResult::skipped(step_id, reason));
    }

    fn skip_pending(&mut self, plan: &Plan, indices: impl IntoIterator<Item = usize>, reason: &SkipReason) {
        for index in indices {
            if self.statuses[index] == StepStatus::Pending {
                self.skip(index, &plan.step(index).id, reason.clone());
            }
        }
    }
}

impl Orchestrator {
    pub fn new(ctx: Arc<HostContext>) -> Self {
        Self {
            ctx,
            jobs: 1,
            limits: ResourceLimits::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Use an externally controlled cancellation token (e.g. Ctrl-C)
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a plan to completion or abort
    #[instrument(skip(self, plan), fields(plan = %plan.name()))]
    pub async fn run(&self, plan: Arc<Plan>) -> Report {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut run_state = RunState::Initializing;
        info!(%run_id, steps = plan.len(), jobs = self.jobs, ?run_state, "Starting plan");

        let resources = Arc::new(Resources::new(self.limits));
        let runner = StepRunner::new(self.ctx.clone()).with_resources(resources);
        let mut ledger = RunLedger::new(plan.len());
        let mut in_flight: JoinSet<(usize, ExecutionResult)> = JoinSet::new();

        run_state = RunState::Executing;
        info!(?run_state, "Executing plan");

        loop {
            if ledger.halted_by.is_none() && !self.cancel.is_cancelled() {
                self.schedule(&plan, &runner, &mut ledger, &mut in_flight);
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            match joined {
                Ok((index, result)) => self.record(&plan, &mut ledger, index, result),
                Err(e) => error!(error = %e, "Step task terminated unexpectedly"),
            }
        }

        self.finalize(&plan, ledger, run_id, started_at)
    }

    /// Launch every ready step, in plan order, up to the job limit
    fn schedule(
        &self,
        plan: &Arc<Plan>,
        runner: &StepRunner,
        ledger: &mut RunLedger,
        in_flight: &mut JoinSet<(usize, ExecutionResult)>,
    ) {
        for &index in plan.order() {
            if in_flight.len() >= self.jobs {
                break;
            }
            if ledger.statuses[index] != StepStatus::Pending {
                continue;
            }
            let ready = plan
                .dependencies_of(index)
                .iter()
                .all(|&dep| ledger.statuses[dep].unblocks_dependents());
            if !ready {
                continue;
            }

            ledger.statuses[index] = StepStatus::Running;

            let step = plan.step(index).clone();
            let runner = runner.clone();
            let token = self.cancel.clone();
            in_flight.spawn(async move {
                let step_id = step.id.clone();
                // Inner task so a panicking action still maps back to its step
                let task = tokio::spawn(async move { runner.run(&step, &token).await });
                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => ExecutionResult::failed(
                        &step_id,
                        1,
                        0,
                        StepError::ActionExecution {
                            step: step_id.clone(),
                            attempt: 1,
                            message: format!("step task failed: {}", e),
                            stderr: String::new(),
                        },
                    ),
                };
                (index, result)
            });
        }
    }

    /// Store a terminal result and apply the failure policy
    fn record(&self, plan: &Plan, ledger: &mut RunLedger, index: usize, result: ExecutionResult) {
        let step = plan.step(index);
        let failed = result.status.is_failed();
        let cancelled = result.is_cancelled() || self.cancel.is_cancelled();

        ledger.statuses[index] = result.status.clone();
        ledger.results[index] = Some(result);

        if !failed {
            return;
        }

        ledger.first_failure.get_or_insert_with(|| step.id.clone());

        // Cancellation always aborts, whatever the step declared
        let policy = if cancelled {
            FailurePolicy::Abort
        } else {
            step.on_failure
        };
        let caused_by = SkipReason::CausedBy(step.id.clone());

        match policy {
            FailurePolicy::Abort | FailurePolicy::SkipRemaining => {
                if ledger.halted_by.is_none() {
                    warn!(step = %step.id, ?policy, "Step failed, halting plan");
                    ledger.halted_by = Some((step.id.clone(), policy));
                    ledger.skip_pending(plan, 0..plan.len(), &caused_by);
                }
            }
            FailurePolicy::ContinueIndependent => {
                let dependents = plan.transitive_dependents(index);
                warn!(
                    step = %step.id,
                    skipped = dependents.len(),
                    "Step failed, skipping its dependents"
                );
                ledger.skip_pending(plan, dependents, &caused_by);
            }
        }
    }

    fn finalize(
        &self,
        plan: &Plan,
        mut ledger: RunLedger,
        run_id: Uuid,
        started_at: chrono::DateTime<Utc>,
    ) -> Report {
        let cancelled = self.cancel.is_cancelled();

        for index in 0..plan.len() {
            if ledger.results[index].is_some() {
                continue;
            }
            let step_id = plan.step(index).id.clone();
            let status = ledger.statuses[index].clone();
            match status {
                StepStatus::Running => {
                    let error = StepError::ActionExecution {
                        step: step_id.clone(),
                        attempt: 1,
                        message: "step task terminated unexpectedly".to_string(),
                        stderr: String::new(),
                    };
                    ledger.statuses[index] = StepStatus::Failed { cancelled: false };
                    ledger.results[index] = Some(ExecutionResult::failed(&step_id, 1, 0, error));
                    ledger.first_failure.get_or_insert(step_id);
                }
                _ if cancelled => ledger.skip(index, &step_id, SkipReason::Cancelled),
                _ => {
                    let reason = ledger
                        .first_failure
                        .clone()
                        .map(SkipReason::CausedBy)
                        .unwrap_or(SkipReason::Cancelled);
                    ledger.skip(index, &step_id, reason);
                }
            }
        }

        let any_failed = ledger.statuses.iter().any(StepStatus::is_failed);
        let aborted = matches!(ledger.halted_by, Some((_, FailurePolicy::Abort))) || cancelled;

        let (run_state, status) = if aborted {
            (RunState::Aborted, ReportStatus::Aborted)
        } else if any_failed {
            (RunState::Completed, ReportStatus::PartialFailure)
        } else {
            (RunState::Completed, ReportStatus::Success)
        };

        let halted_by = ledger
            .halted_by
            .map(|(id, _)| id)
            .or(ledger.first_failure);

        let results: Vec<ExecutionResult> = plan
            .order()
            .iter()
            .filter_map(|&index| ledger.results[index].take())
            .collect();

        match status {
            ReportStatus::Success => info!(%run_id, ?run_state, "Plan completed successfully"),
            _ => error!(%run_id, ?run_state, %status, halted_by = ?halted_by, "Plan did not complete cleanly"),
        }

        Report {
            run_id,
            plan_name: plan.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            run_state,
            status,
            halted_by,
            results,
        }
    }

    /// Evaluate every precondition and verification without running actions
    #[instrument(skip(self, plan), fields(plan = %plan.name()))]
    pub async fn dry_run(&self, plan: &Plan) -> Forecast {
        let runner = StepRunner::new(self.ctx.clone());
        let mut steps = Vec::with_capacity(plan.len());
        for step in plan.ordered_steps() {
            steps.push(runner.forecast(step).await);
        }

        info!(steps = steps.len(), "Dry run complete");
        Forecast {
            plan_name: plan.name().to_string(),
            steps,
        }
    }
}
