//! Cooperative cancellation for the stage loops.
//!
//! Stage loops do not know where cancellation comes from. They receive a
//! [`CancellationProbe`] and consult it at stage boundaries and every
//! `check_every` items; the task runner's probe reads the persisted task
//! status, so a cancel issued by another process is seen on the next check.

use async_trait::async_trait;

use crate::progress::StageProgressReporter;
use crate::task::TaskStore;

#[async_trait]
pub trait CancellationProbe: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// Polls the task store for a `cancelled` status.
pub struct StoreProbe {
    store: TaskStore,
    task_id: String,
}

impl StoreProbe {
    pub fn new(store: TaskStore, task_id: impl Into<String>) -> Self {
        Self {
            store,
            task_id: task_id.into(),
        }
    }
}

#[async_trait]
impl CancellationProbe for StoreProbe {
    async fn is_cancelled(&self) -> bool {
        self.store.is_cancelled(&self.task_id).await
    }
}

/// Outcome of a stage that may stop early.
#[derive(Debug)]
pub enum StageResult<T> {
    Done(T),
    Cancelled,
}

/// What a stage loop needs besides its inputs.
pub struct StageContext<'a> {
    pub probe: &'a dyn CancellationProbe,
    pub check_every: usize,
    pub progress: &'a dyn StageProgressReporter,
}

impl StageContext<'_> {
    /// Poll the probe if `index` falls on the check interval.
    pub async fn should_stop(&self, index: usize) -> bool {
        index % self.check_every.max(1) == 0 && self.probe.is_cancelled().await
    }
}
