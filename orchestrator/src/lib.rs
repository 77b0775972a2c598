//! The parallel backfill orchestrator.
//!
//! To serve a request starting at some block, every store module in the
//! requested module's ancestry must first be materialized up to that block.
//! The orchestrator probes durable storage for what already exists, plans
//! the missing work as prioritized jobs, runs them on a bounded worker pool
//! against an [`ExecutionRuntime`], and squashes the resulting partial
//! fragments into contiguous complete snapshots, reporting progress along
//! the way.

pub mod error;
pub mod job;
pub mod metrics;
pub mod notifier;
pub mod plan;
pub mod progress;
mod scheduler;
pub mod squasher;
pub mod worker;


use std::{collections::BTreeMap, sync::Arc};

use common::{BlockNum, Config};
use storage::{
    manifest::ModuleGraph,
    snapshot::Snapshots,
    state::{ModuleStateMap, StoreStorageState},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub use error::OrchestrationError;
pub use progress::{ModuleProgress, ProgressEvent, TerminalStatus};
pub use worker::{ExecutionError, ExecutionOutcome, ExecutionRequest, ExecutionRuntime};

use crate::{
    metrics::Metrics,
    notifier::Notifier,
    plan::Plan,
    progress::{ProgressHandle, Reporter},
    scheduler::Scheduler,
    squasher::Squasher,
    worker::WorkerContext,
};

/// One backfill request: materialize every store in `output_module`'s
/// ancestry for blocks `[module initial block, start_block)`.
///
/// `stop_block` bounds the live phase that follows the backfill; it is
/// validated here and carried for the caller, not consumed.
#[derive(Clone, Debug)]
pub struct BackfillRequest {
    pub output_module: String,
    pub start_block: BlockNum,
    pub stop_block: BlockNum,
}

pub struct Orchestrator<R> {
    config: Config,
    graph: Arc<ModuleGraph>,
    runtime: Arc<R>,
}

impl<R: ExecutionRuntime> Orchestrator<R> {
    pub fn new(config: Config, graph: ModuleGraph, runtime: R) -> Orchestrator<R> {
        Orchestrator {
            config,
            graph: Arc::new(graph),
            runtime: Arc::new(runtime),
        }
    }

    /// The runtime jobs execute against.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Starts the backfill. The returned handle carries the progress event
    /// stream and resolves to the terminal status; cancel `cancel` to stop
    /// the run.
    pub fn run(&self, request: BackfillRequest, cancel: CancellationToken) -> BackfillRun {
        let (events_tx, events_rx) = mpsc::channel(64);
        let handle = tokio::spawn(run_inner(
            self.config.clone(),
            self.graph.clone(),
            self.runtime.clone(),
            request,
            cancel,
            events_tx,
        ));
        BackfillRun {
            progress: events_rx,
            handle,
        }
    }
}

/// A running backfill: the progress stream plus the terminal result.
pub struct BackfillRun {
    /// Progress events, ending with [`ProgressEvent::Finished`].
    pub progress: mpsc::Receiver<ProgressEvent>,
    handle: JoinHandle<Result<(), OrchestrationError>>,
}

impl BackfillRun {
    /// Awaits the terminal status. Progress events not yet consumed are
    /// dropped.
    pub async fn wait(self) -> Result<(), OrchestrationError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_err) => Err(OrchestrationError::WorkerTask(join_err.into())),
        }
    }
}

async fn run_inner<R: ExecutionRuntime>(
    config: Config,
    graph: Arc<ModuleGraph>,
    runtime: Arc<R>,
    request: BackfillRequest,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<ProgressEvent>,
) -> Result<(), OrchestrationError> {
    // Probing and planning happen before any progress reporting exists;
    // failures there close the stream directly.
    let (states, plan) = match prepare(&config, &graph, &request).await {
        Ok(prepared) => prepared,
        Err(err) => {
            let status = TerminalStatus::Failed(err.to_string());
            let _ = events_tx.send(ProgressEvent::Finished(status)).await;
            return Err(err);
        }
    };

    let notifier = Arc::new(Notifier::new());
    let scheduler_rx = notifier.subscribe();
    let reporter_rx = notifier.subscribe();

    let seed = states.values().map(|state| {
        (
            state.module_name.clone(),
            state.initial_complete_file.as_ref().map(|f| f.range),
        )
    });
    let (reporter, progress) = Reporter::new(
        config.progress_interval,
        seed.collect::<Vec<_>>(),
        reporter_rx,
        events_tx,
    );
    tokio::spawn(reporter.run());

    let result = execute(
        &config,
        &request,
        &states,
        plan,
        runtime,
        notifier,
        scheduler_rx,
        progress.clone(),
        cancel,
    )
    .await;

    let status = match &result {
        Ok(()) => TerminalStatus::Completed,
        Err(err) if err.is_cancelled() => TerminalStatus::Cancelled,
        Err(err) => TerminalStatus::Failed(err.to_string()),
    };
    progress.terminal(status);
    result
}

/// Probes durable storage for every store in the output module's ancestry
/// and builds the work plan.
async fn prepare(
    config: &Config,
    graph: &ModuleGraph,
    request: &BackfillRequest,
) -> Result<(ModuleStateMap, Arc<Plan>), OrchestrationError> {
    if request.start_block >= request.stop_block {
        return Err(OrchestrationError::Plan(
            format!(
                "start block {} is not below stop block {}",
                request.start_block, request.stop_block
            )
            .into(),
        ));
    }

    let stores = graph
        .stores_down_to(&request.output_module)
        .map_err(|err| OrchestrationError::Plan(err.into()))?;

    let mut states = ModuleStateMap::new();
    for module in stores {
        let snapshots = Snapshots::list(&config.data_store, &module.name, &module.hash)
            .await
            .map_err(|err| OrchestrationError::Probe(err.into()))?;
        let state = StoreStorageState::probe(
            module,
            &snapshots,
            request.start_block,
            config.save_interval,
        )
        .map_err(|err| OrchestrationError::Plan(err.into()))?;
        tracing::info!(
            module = %module.name,
            complete_up_to = state.base_end(),
            present = %state.partials_present,
            missing = %state.partials_missing,
            "probed storage state"
        );
        states.insert(module.name.clone(), state);
    }

    let plan = Plan::build(graph, &states, config.subrequest_split)
        .map_err(OrchestrationError::Plan)?;
    Ok((states, Arc::new(plan)))
}

#[allow(clippy::too_many_arguments)]
async fn execute<R: ExecutionRuntime>(
    config: &Config,
    request: &BackfillRequest,
    states: &ModuleStateMap,
    plan: Arc<Plan>,
    runtime: Arc<R>,
    notifier: Arc<Notifier>,
    scheduler_rx: mpsc::UnboundedReceiver<notifier::StoreReady>,
    progress: ProgressHandle,
    cancel: CancellationToken,
) -> Result<(), OrchestrationError> {
    let metrics = Arc::new(Metrics::new());
    let squasher = Arc::new(
        Squasher::new(
            config.data_store.clone(),
            states,
            config.save_interval,
            request.start_block,
            notifier,
            metrics.clone(),
        )
        .await?,
    );

    // Fragments from earlier runs merge before any worker runs; boundary
    // snapshots they produce promote dependents through the notifier like
    // any other completion.
    for (name, state) in states {
        for range in state.partials_present.iter() {
            squasher.squash(name, *range).await?;
        }
    }

    let module_hashes: BTreeMap<String, String> = states
        .iter()
        .map(|(name, state)| (name.clone(), state.module_hash.clone()))
        .collect();

    let meter = common::BytesMeter::new();
    let scheduler = Scheduler {
        plan,
        worker_ctx: WorkerContext {
            runtime,
            squasher: squasher.clone(),
            progress,
            meter: meter.clone(),
            metrics,
            retries: config.retries,
            min_backoff: config.min_backoff,
            max_backoff: config.max_backoff,
            cancel,
        },
        parallelism: config.parallelism,
        module_hashes,
        ready_rx: scheduler_rx,
    };
    scheduler.run().await?;

    // Every job ran; the stores must now be complete and contiguous.
    squasher.stores_ready().await?;
    tracing::info!(
        bytes_read = meter.bytes_read(),
        bytes_written = meter.bytes_written(),
        "backfill complete"
    );
    Ok(())
}
