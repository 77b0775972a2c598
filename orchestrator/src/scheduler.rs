//! The scheduler loop: semaphore-bounded dispatch of ready jobs, promotion
//! of waiting jobs as store snapshots land, and teardown on failure or
//! cancellation.

use std::{collections::BTreeMap, sync::Arc};

use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};

use crate::{
    error::OrchestrationError,
    job::Job,
    notifier::StoreReady,
    plan::Plan,
    worker::{run_job, ExecutionRequest, ExecutionRuntime, WorkerContext},
};

pub(crate) struct Scheduler<R: ExecutionRuntime> {
    pub plan: Arc<Plan>,
    pub worker_ctx: WorkerContext<R>,
    pub parallelism: usize,
    /// Module name to module hash, for building execution requests.
    pub module_hashes: BTreeMap<String, String>,
    /// Store-availability events published by the squasher.
    pub ready_rx: mpsc::UnboundedReceiver<StoreReady>,
}

impl<R: ExecutionRuntime> Scheduler<R> {
    /// Runs the plan to completion. Returns when every job has run and been
    /// observed, or on the first terminal failure, or on cancellation; in
    /// the failure cases, in-flight workers are cancelled and awaited before
    /// returning.
    pub(crate) async fn run(mut self) -> Result<(), OrchestrationError> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut in_flight: JoinSet<Result<(), OrchestrationError>> = JoinSet::new();
        // Set when no job is ready: dispatch pauses until a completion or a
        // store notification makes re-checking worthwhile.
        let mut parked = false;
        let cancel = self.worker_ctx.cancel.clone();

        let result = loop {
            tokio::select! { biased;
                _ = cancel.cancelled() => {
                    break Err(OrchestrationError::Cancelled);
                }

                // Store snapshots landing promote waiting jobs. This arm
                // precedes dispatch, so a promotion is always observed
                // before the next dispatch decision.
                Some(notification) = self.ready_rx.recv() => {
                    self.plan.mark_dependency_complete(
                        &notification.module,
                        notification.up_to_block,
                    );
                    parked = false;
                }

                Some(joined) = in_flight.join_next() => {
                    self.worker_ctx.metrics.active_workers.set(in_flight.len() as i64);
                    match joined {
                        Ok(Ok(())) => {
                            parked = false;
                        }
                        Ok(Err(err)) => break Err(err),
                        Err(join_err) => {
                            break Err(OrchestrationError::WorkerTask(join_err.into()));
                        }
                    }
                }

                permit = semaphore.clone().acquire_owned(), if !parked => {
                    let permit = permit.expect("scheduler semaphore is never closed");
                    match self.plan.next_job() {
                        (Some(job), _) => self.dispatch(&mut in_flight, permit, job),
                        (None, more_coming) => {
                            drop(permit);
                            if in_flight.is_empty() {
                                if more_coming {
                                    // Nothing runs, nothing is queued, yet
                                    // jobs still wait: their dependencies
                                    // can never be satisfied.
                                    break Err(OrchestrationError::Plan(
                                        format!(
                                            "waiting jobs can no longer be promoted ({})",
                                            self.plan
                                        )
                                        .into(),
                                    ));
                                }
                                break Ok(());
                            }
                            parked = true;
                        }
                    }
                }
            }
        };

        if let Err(err) = &result {
            if !err.is_cancelled() {
                tracing::error!(error = %err, "scheduler failed, cancelling outstanding work");
            }
            cancel.cancel();
        }
        // Await in-flight workers; their results no longer change the outcome.
        while in_flight.join_next().await.is_some() {}
        self.worker_ctx.metrics.active_workers.set(0);

        result
    }

    fn dispatch(
        &self,
        in_flight: &mut JoinSet<Result<(), OrchestrationError>>,
        permit: OwnedSemaphorePermit,
        job: Job,
    ) {
        let request = ExecutionRequest {
            module_name: job.module_name.clone(),
            module_hash: self
                .module_hashes
                .get(&job.module_name)
                .cloned()
                .unwrap_or_default(),
            range: job.request_range,
            required_stores: job.required_modules.clone(),
        };

        tracing::info!(%job, "dispatching job");
        self.worker_ctx.metrics.jobs_dispatched.inc();
        let ctx = self.worker_ctx.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            run_job(ctx, job, request).await
        });
        self.worker_ctx.metrics.active_workers.set(in_flight.len() as i64);
    }
}
