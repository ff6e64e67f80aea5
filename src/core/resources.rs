//! Shared-resource limits for parallel execution.
//!
//! Two mechanisms bound what may run at the same time:
//! - one semaphore per [`ConcurrencyClass`] (network, build, local)
//! - one mutex per lock tag, so steps writing the same path never overlap
//!
//! Lock tags are always taken in sorted order and before the class permit,
//! which keeps acquisition deadlock-free. Tags are held for the whole step
//! so that a precondition and the action it guards see the same state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{AcquireError, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::step::{ConcurrencyClass, Step};

/// Per-class concurrency limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_network")]
    pub network: usize,

    #[serde(default = "default_build")]
    pub build: usize,

    #[serde(default = "default_local")]
    pub local: usize,
}

fn default_network() -> usize {
    4
}
fn default_build() -> usize {
    1
}
fn default_local() -> usize {
    4
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            network: default_network(),
            build: default_build(),
            local: default_local(),
        }
    }
}

impl ResourceLimits {
    pub fn limit(&self, class: ConcurrencyClass) -> usize {
        let limit = match class {
            ConcurrencyClass::Network => self.network,
            ConcurrencyClass::Build => self.build,
            ConcurrencyClass::Local => self.local,
        };
        limit.max(1)
    }
}

/// Lock tags held while a step runs, from precondition to verification
#[derive(Debug)]
pub struct LockGuard {
    _locks: Vec<OwnedMutexGuard<()>>,
}

/// Class permit held for the duration of one action attempt
#[derive(Debug)]
pub struct PermitGuard {
    _permit: OwnedSemaphorePermit,
}

/// Pools and lock tags shared by all steps of a run
#[derive(Debug)]
pub struct Resources {
    network: Arc<Semaphore>,
    build: Arc<Semaphore>,
    local: Arc<Semaphore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for Resources {
    fn default() -> Self {
        Self::new(ResourceLimits::default())
    }
}

impl Resources {
    pub fn new(limits: ResourceLimits) -> Self {
        let pool = |class| Arc::new(Semaphore::new(limits.limit(class)));
        Self {
            network: pool(ConcurrencyClass::Network),
            build: pool(ConcurrencyClass::Build),
            local: pool(ConcurrencyClass::Local),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, tag: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Take every lock tag of the step, in sorted order
    pub async fn lock_tags(&self, step: &Step) -> LockGuard {
        let mut guards = Vec::with_capacity(step.locks.len());
        // BTreeSet iteration is sorted
        for tag in &step.locks {
            guards.push(self.lock_for(tag).lock_owned().await);
        }
        if !guards.is_empty() {
            debug!(step = %step.id, locks = guards.len(), "Lock tags acquired");
        }
        LockGuard { _locks: guards }
    }

    /// Wait for a permit from the step's class pool
    pub async fn permit(&self, step: &Step) -> Result<PermitGuard, AcquireError> {
        let permit = self.pool(step.class).acquire_owned().await?;
        debug!(step = %step.id, class = %step.class, "Class permit acquired");
        Ok(PermitGuard { _permit: permit })
    }

    fn pool(&self, class: ConcurrencyClass) -> Arc<Semaphore> {
        match class {
            ConcurrencyClass::Network => self.network.clone(),
            ConcurrencyClass::Build => self.build.clone(),
            ConcurrencyClass::Local => self.local.clone(),
        }
    }

    /// Permits currently free in a class pool
    pub fn available(&self, class: ConcurrencyClass) -> usize {
        self.pool(class).available_permits()
    }
}
