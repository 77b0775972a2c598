use common::{BlockRange, BoxError};

use crate::squasher::SquashError;

/// Terminal outcomes of a backfill request.
///
/// These are the errors that reach the caller. Transient worker errors are
/// recovered inside the scheduler's retry budget and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// Durable storage could not be inspected while planning. Probing is
    /// read-only, so re-running the request is always safe.
    #[error("probing storage state: {0}")]
    Probe(#[source] BoxError),

    /// The work plan could not be built, or reached a state where waiting
    /// jobs can never be promoted.
    #[error("work plan: {0}")]
    Plan(#[source] BoxError),

    /// A job failed deterministically or exhausted its retries.
    #[error("job {module} {range}: {source}")]
    Job {
        module: String,
        range: BlockRange,
        #[source]
        source: BoxError,
    },

    /// A worker task died without reporting a result.
    #[error("worker task failed: {0}")]
    WorkerTask(#[source] BoxError),

    /// Merging or persisting store fragments failed; on-disk data is
    /// presumed corrupt and the caller must re-run.
    #[error(transparent)]
    Squash(#[from] SquashError),

    /// The caller cancelled the request. Not a data error; on-disk artifacts
    /// remain resumable.
    #[error("request cancelled")]
    Cancelled,
}

impl OrchestrationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OrchestrationError::Cancelled)
    }
}
