//! The worker side of the pool: one task per dispatched job, retrying
//! transient runtime failures with bounded exponential backoff, then handing
//! the produced fragments to the squasher.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use common::{BlockRange, BoxError, BytesMeter, Ranges};
use tokio_util::sync::CancellationToken;

use crate::{
    error::OrchestrationError, job::Job, metrics::Metrics, progress::ProgressHandle,
    squasher::Squasher,
};

/// One request against the external computation runtime.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub module_name: String,
    pub module_hash: String,
    pub range: BlockRange,
    /// Store modules whose snapshots the runtime must load before running.
    pub required_stores: Vec<String>,
}

/// A successful execution: the runtime wrote one partial fragment per
/// save-interval boundary it crossed.
#[derive(Clone, Debug)]
pub struct ExecutionOutcome {
    pub partials_written: Ranges,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Worth retrying: I/O timeouts, runtime restarts.
    #[error("transient execution error: {0}")]
    Transient(#[source] BoxError),

    /// Deterministic failure; retrying cannot help.
    #[error("terminal execution error: {0}")]
    Terminal(#[source] BoxError),
}

/// The external runtime that evaluates a module over a block range. It is
/// responsible for loading required upstream snapshots through the storage
/// interface and for writing its partial fragments there.
#[async_trait]
pub trait ExecutionRuntime: Send + Sync + 'static {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError>;
}

/// Everything a worker task needs, cloned per dispatch.
pub(crate) struct WorkerContext<R> {
    pub runtime: Arc<R>,
    pub squasher: Arc<Squasher>,
    pub progress: ProgressHandle,
    pub meter: BytesMeter,
    pub metrics: Arc<Metrics>,
    pub retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub cancel: CancellationToken,
}

impl<R> Clone for WorkerContext<R> {
    fn clone(&self) -> Self {
        WorkerContext {
            runtime: self.runtime.clone(),
            squasher: self.squasher.clone(),
            progress: self.progress.clone(),
            meter: self.meter.clone(),
            metrics: self.metrics.clone(),
            retries: self.retries,
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            cancel: self.cancel.clone(),
        }
    }
}

/// Executes one job to completion: retry transient failures within the
/// budget, then squash the fragments the runtime produced.
pub(crate) async fn run_job<R: ExecutionRuntime>(
    ctx: WorkerContext<R>,
    mut job: Job,
    request: ExecutionRequest,
) -> Result<(), OrchestrationError> {
    job.scheduled_at = Some(Instant::now());
    ctx.progress.job_scheduled(&job);

    let mut backoff = ctx.min_backoff;
    let outcome = loop {
        job.attempts += 1;
        match ctx
            .runtime
            .execute(request.clone(), ctx.cancel.child_token())
            .await
        {
            Ok(outcome) => break outcome,
            Err(ExecutionError::Transient(source)) if job.attempts <= ctx.retries => {
                ctx.metrics.jobs_retried.inc();
                tracing::warn!(
                    module = %job.module_name,
                    range = %job.request_range,
                    attempt = job.attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %source,
                    "transient job failure, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ctx.cancel.cancelled() => return Err(OrchestrationError::Cancelled),
                }
                backoff = (backoff * 2).min(ctx.max_backoff);
            }
            Err(err) => {
                ctx.metrics.jobs_failed.inc();
                ctx.progress.job_failed(&job, err.to_string());
                return Err(OrchestrationError::Job {
                    module: job.module_name.clone(),
                    range: job.request_range,
                    source: err.into(),
                });
            }
        }
    };

    ctx.meter.add_bytes_read(outcome.bytes_read);
    ctx.meter.add_bytes_written(outcome.bytes_written);
    ctx.progress
        .job_completed(&job, outcome.bytes_read, outcome.bytes_written);
    tracing::info!(
        module = %job.module_name,
        range = %job.request_range,
        attempts = job.attempts,
        partials = %outcome.partials_written,
        "job completed"
    );

    ctx.squasher
        .squash(&job.module_name, job.request_range)
        .await?;
    Ok(())
}
