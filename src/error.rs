//! Domain error types.
//!
//! Most of the crate propagates [`anyhow::Error`] with context attached at
//! the seams. The variants here are the ones callers match on: the HTTP API
//! maps them to status codes, and the orchestrator turns them into failure
//! messages on the task record.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CuratorError {
    /// The curation platform has no dataset with this id.
    #[error("dataset {0} not found on the curation platform")]
    DatasetNotFound(i64),

    /// Task parameters failed validation.
    #[error("invalid task parameters: {0}")]
    InvalidParams(String),

    /// No task record with this id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The requested status change is not allowed from the task's current state.
    #[error("task {task_id} cannot move from {from} to {to}")]
    IllegalTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("unknown task status: {0}")]
    UnknownStatus(String),

    #[error("unknown label level: '{0}'. Must be category, brand, brandform, variant, sku, or text")]
    UnknownLabelLevel(String),

    /// The label workbook could not be read.
    #[error("schema sheet error: {0}")]
    Sheet(String),
}
