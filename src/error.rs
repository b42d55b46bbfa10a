//! Top-level error aggregation.
//!
//! Each module owns a local `thiserror` enum (see `task_graph::TaskGraphError`,
//! `worker_pool::WorkerPoolError`, etc). `CoreError` composes them for callers
//! that cross module boundaries, the way `eyre::Result` composes `LlmError`/
//! `WorktreeError` at the orchestration layer in the teacher crate.

use thiserror::Error;

use crate::message_channel::MessageChannelError;
use crate::review_coordinator::ReviewCoordinatorError;
use crate::task_graph::TaskGraphError;
use crate::worker_pool::WorkerPoolError;
use crate::workspace_validator::WorkspaceValidatorError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    TaskGraph(#[from] TaskGraphError),

    #[error(transparent)]
    WorkerPool(#[from] WorkerPoolError),

    #[error(transparent)]
    MessageChannel(#[from] MessageChannelError),

    #[error(transparent)]
    WorkspaceValidator(#[from] WorkspaceValidatorError),

    #[error(transparent)]
    ReviewCoordinator(#[from] ReviewCoordinatorError),

    #[error("disposed")]
    Disposed,
}
