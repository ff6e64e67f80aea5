//! Step definitions: the atomic unit of provisioning work.
//!
//! A step is pure data plus an action and two optional host checks. It
//! holds no hidden state; everything it needs about the host arrives
//! through the [`HostContext`] passed at execution time.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapters::AdapterResult;
use crate::context::HostContext;

/// Work performed by a step, usually a call into one adapter
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, ctx: &HostContext, cancel: &CancellationToken) -> AdapterResult;

    /// Short human-readable summary for logs and dry runs
    fn describe(&self) -> String;
}

/// Predicate over host state.
///
/// `Ok(false)` means "not satisfied"; `Err` means the check itself could
/// not be evaluated.
#[async_trait]
pub trait HostCheck: Send + Sync {
    async fn check(&self, ctx: &HostContext) -> anyhow::Result<bool>;

    fn describe(&self) -> String;
}

/// Synchronous closure as a [`StepAction`]
pub struct FnAction<F> {
    label: String,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&HostContext) -> AdapterResult + Send + Sync,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> StepAction for FnAction<F>
where
    F: Fn(&HostContext) -> AdapterResult + Send + Sync,
{
    async fn run(&self, ctx: &HostContext, _cancel: &CancellationToken) -> AdapterResult {
        (self.f)(ctx)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Synchronous closure as a [`HostCheck`]
pub struct FnCheck<F> {
    label: String,
    f: F,
}

impl<F> FnCheck<F>
where
    F: Fn(&HostContext) -> anyhow::Result<bool> + Send + Sync,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> HostCheck for FnCheck<F>
where
    F: Fn(&HostContext) -> anyhow::Result<bool> + Send + Sync,
{
    async fn check(&self, ctx: &HostContext) -> anyhow::Result<bool> {
        (self.f)(ctx)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// What the orchestrator does when a step ends `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip everything not yet run; the run is aborted
    #[default]
    Abort,

    /// Skip everything not yet run; the run completes with partial failure
    SkipRemaining,

    /// Skip only steps that depend on the failed one
    ContinueIndependent,
}

/// Resource pool a step draws from while running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyClass {
    /// Downloads, clones, package installs
    Network,

    /// Compilation
    Build,

    /// Local filesystem work
    #[default]
    Local,
}

impl fmt::Display for ConcurrencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Build => "build",
            Self::Local => "local",
        };
        f.write_str(name)
    }
}

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// delay * attempt
    #[default]
    Linear,

    /// delay * 2^(attempt - 1)
    Exponential,
}

/// Retry policy for failed actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default = "default_delay")]
    pub delay_ms: u64,

    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_delay() -> u64 {
    2000
}
fn default_max_delay() -> u64 {
    30000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay(),
            max_delay_ms: default_max_delay(),
            backoff: Backoff::Linear,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn once() -> Self {
        Self::default()
    }

    /// Default for network-bound steps: three attempts, linear backoff
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            ..Self::default()
        }
    }

    pub fn attempts(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Delay to wait after a failed attempt (1-indexed)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1) as u64;
        let delay = match self.backoff {
            Backoff::Linear => self.delay_ms.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Check if another attempt is allowed after `attempt`
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// A single declared unit of provisioning work
#[derive(Clone)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub depends_on: BTreeSet<String>,
    pub precondition: Option<Arc<dyn HostCheck>>,
    pub action: Arc<dyn StepAction>,
    pub verify: Option<Arc<dyn HostCheck>>,
    pub on_failure: FailurePolicy,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub class: ConcurrencyClass,
    /// Resource tags held for the duration of the action
    pub locks: BTreeSet<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self::from_arc(id, Arc::new(action))
    }

    pub fn from_arc(id: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        let id = id.into();
        Self {
            description: action.describe(),
            id,
            depends_on: BTreeSet::new(),
            precondition: None,
            action,
            verify: None,
            on_failure: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            timeout: None,
            class: ConcurrencyClass::default(),
            locks: BTreeSet::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn precondition(mut self, check: impl HostCheck + 'static) -> Self {
        self.precondition = Some(Arc::new(check));
        self
    }

    pub fn verify(mut self, check: impl HostCheck + 'static) -> Self {
        self.verify = Some(Arc::new(check));
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn class(mut self, class: ConcurrencyClass) -> Self {
        self.class = class;
        self
    }

    pub fn lock(mut self, tag: impl Into<String>) -> Self {
        self.locks.insert(tag.into());
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("depends_on", &self.depends_on)
            .field("precondition", &self.precondition.as_ref().map(|c| c.describe()))
            .field("action", &self.action.describe())
            .field("verify", &self.verify.as_ref().map(|c| c.describe()))
            .field("on_failure", &self.on_failure)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("class", &self.class)
            .field("locks", &self.locks)
            .finish()
    }
}
