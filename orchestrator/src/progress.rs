//! Aggregates job and squasher activity into the caller-facing progress
//! stream, rate-limited per module with immediate emission of terminal
//! transitions.

use std::{collections::BTreeMap, time::Duration};

use common::{BlockNum, BlockRange, Ranges};
use tokio::{
    sync::mpsc,
    time::MissedTickBehavior,
};

use crate::{job::Job, notifier::StoreReady};

/// What the caller receives on the progress stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Periodic per-module state, at most one entry per module per tick.
    Modules(Vec<ModuleProgress>),
    /// A job failed terminally; emitted immediately.
    Failed {
        module: String,
        range: BlockRange,
        reason: String,
    },
    /// The run ended; always the last event.
    Finished(TerminalStatus),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleProgress {
    pub module: String,
    /// Ranges whose jobs completed, coalesced.
    pub processed_ranges: Vec<BlockRange>,
    /// Highest block a complete snapshot (or seeded image) reaches.
    pub available_up_to: Option<BlockNum>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// The terminal failure reason, when the module failed the request.
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Clone, Debug)]
enum Update {
    JobScheduled {
        module: String,
    },
    JobCompleted {
        module: String,
        range: BlockRange,
        bytes_read: u64,
        bytes_written: u64,
    },
    JobFailed {
        module: String,
        range: BlockRange,
        reason: String,
    },
    Terminal(TerminalStatus),
}

/// Write side handed to workers and squashables.
#[derive(Clone, Debug)]
pub struct ProgressHandle {
    tx: mpsc::UnboundedSender<Update>,
}

impl ProgressHandle {
    pub(crate) fn job_scheduled(&self, job: &Job) {
        self.send(Update::JobScheduled {
            module: job.module_name.clone(),
        });
    }

    pub(crate) fn job_completed(
        &self,
        job: &Job,
        bytes_read: u64,
        bytes_written: u64,
    ) {
        self.send(Update::JobCompleted {
            module: job.module_name.clone(),
            range: job.request_range,
            bytes_read,
            bytes_written,
        });
    }

    pub(crate) fn job_failed(&self, job: &Job, reason: String) {
        self.send(Update::JobFailed {
            module: job.module_name.clone(),
            range: job.request_range,
            reason,
        });
    }

    /// Flushes all dirty state and closes the stream with `status`.
    pub(crate) fn terminal(&self, status: TerminalStatus) {
        self.send(Update::Terminal(status));
    }

    fn send(&self, update: Update) {
        // The reporter outlives every sender except during teardown, where
        // losing a message is fine.
        let _ = self.tx.send(update);
    }
}

/// Per-module accumulated state inside the reporter.
#[derive(Debug, Default)]
struct ModuleState {
    processed: Ranges,
    available_up_to: Option<BlockNum>,
    bytes_read: u64,
    bytes_written: u64,
    error: Option<String>,
    dirty: bool,
}

pub(crate) struct Reporter {
    interval: Duration,
    rx: mpsc::UnboundedReceiver<Update>,
    /// Store-availability events, subscribed from the notifier.
    store_ready: mpsc::UnboundedReceiver<StoreReady>,
    events: mpsc::Sender<ProgressEvent>,
    modules: BTreeMap<String, ModuleState>,
}

impl Reporter {
    /// Builds the reporter and its write handle. `seed` carries each
    /// module's pre-existing coverage so the first emission reflects what
    /// was already on disk.
    pub(crate) fn new(
        interval: Duration,
        seed: impl IntoIterator<Item = (String, Option<BlockRange>)>,
        store_ready: mpsc::UnboundedReceiver<StoreReady>,
        events: mpsc::Sender<ProgressEvent>,
    ) -> (Reporter, ProgressHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut modules = BTreeMap::new();
        for (module, covered) in seed {
            let mut state = ModuleState::default();
            if let Some(range) = covered {
                state.processed.insert(range).unwrap();
                state.available_up_to = Some(range.exclusive_end_block);
                state.dirty = true;
            }
            modules.insert(module, state);
        }
        (
            Reporter {
                interval,
                rx,
                store_ready,
                events,
                modules,
            },
            ProgressHandle { tx },
        )
    }

    /// Runs until the terminal update arrives (or every handle is dropped).
    pub(crate) async fn run(mut self) {
        // Report pre-existing coverage before any job activity.
        self.emit_dirty().await;

        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                update = self.rx.recv() => {
                    match update {
                        Some(Update::Terminal(status)) => {
                            // Availability events may still be queued behind
                            // the terminal update; account for them first.
                            while let Ok(ready) = self.store_ready.try_recv() {
                                self.store_advanced(ready);
                            }
                            self.emit_dirty().await;
                            let _ = self.events.send(ProgressEvent::Finished(status)).await;
                            return;
                        }
                        Some(update) => self.apply(update).await,
                        None => {
                            // Senders vanished without a terminal status;
                            // flush what we have and stop.
                            self.emit_dirty().await;
                            return;
                        }
                    }
                }
                Some(ready) = self.store_ready.recv() => {
                    self.store_advanced(ready);
                }
                _ = ticker.tick() => {
                    self.emit_dirty().await;
                }
            }
        }
    }

    fn store_advanced(&mut self, ready: StoreReady) {
        let state = self.modules.entry(ready.module).or_default();
        state.available_up_to = Some(
            state
                .available_up_to
                .unwrap_or(0)
                .max(ready.up_to_block),
        );
        state.dirty = true;
    }

    async fn apply(&mut self, update: Update) {
        match update {
            Update::JobScheduled { module } => {
                // Scheduling alone changes nothing the caller sees; it only
                // ensures the module appears in the next emission.
                self.modules.entry(module).or_default();
            }
            Update::JobCompleted {
                module,
                range,
                bytes_read,
                bytes_written,
            } => {
                let state = self.modules.entry(module).or_default();
                if state.processed.insert(range).is_err() {
                    // A duplicate report from a retried job; totals still count.
                    tracing::debug!(range = %range, "duplicate processed range");
                }
                state.bytes_read += bytes_read;
                state.bytes_written += bytes_written;
                state.dirty = true;
            }
            Update::JobFailed {
                module,
                range,
                reason,
            } => {
                let state = self.modules.entry(module.clone()).or_default();
                state.error = Some(reason.clone());
                state.dirty = true;
                let _ = self
                    .events
                    .send(ProgressEvent::Failed {
                        module,
                        range,
                        reason,
                    })
                    .await;
            }
            Update::Terminal(_) => unreachable!("Terminal is matched before apply() is called"),
        }
    }

    async fn emit_dirty(&mut self) {
        let mut progress = Vec::new();
        for (module, state) in &mut self.modules {
            if !state.dirty {
                continue;
            }
            state.dirty = false;
            progress.push(ModuleProgress {
                module: module.clone(),
                processed_ranges: state.processed.merged().into_iter().collect(),
                available_up_to: state.available_up_to,
                bytes_read: state.bytes_read,
                bytes_written: state.bytes_written,
                error: state.error.clone(),
            });
        }
        if !progress.is_empty() {
            let _ = self.events.send(ProgressEvent::Modules(progress)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::BlockRange;
    use tokio::sync::mpsc;

    use super::{ProgressEvent, Reporter, TerminalStatus};
    use crate::job::Job;

    fn job(module: &str, range: (u64, u64)) -> Job {
        Job::new(
            module.to_string(),
            BlockRange::new(range.0, range.1),
            vec![],
            1,
        )
    }

    #[tokio::test]
    async fn coalesces_ranges_and_flushes_on_terminal() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (reporter, handle) = Reporter::new(
            Duration::from_secs(3600), // ticks never fire in this test
            [("As".to_string(), Some(BlockRange::new(0, 100)))],
            ready_rx,
            events_tx,
        );
        let reporter = tokio::spawn(reporter.run());

        handle.job_completed(&job("As", (100, 200)), 10, 20);
        handle.job_completed(&job("As", (300, 400)), 1, 2);
        ready_tx
            .send(crate::notifier::StoreReady {
                module: "As".to_string(),
                up_to_block: 200,
            })
            .unwrap();
        handle.terminal(TerminalStatus::Completed);

        // The initial emission reflects only the seeded complete file.
        match events_rx.recv().await.unwrap() {
            ProgressEvent::Modules(modules) => {
                assert_eq!(modules[0].processed_ranges, vec![BlockRange::new(0, 100)]);
                assert_eq!(modules[0].available_up_to, Some(100));
            }
            other => panic!("expected initial module progress, got {other:?}"),
        }

        let event = events_rx.recv().await.unwrap();
        match event {
            ProgressEvent::Modules(modules) => {
                assert_eq!(modules.len(), 1);
                let progress = &modules[0];
                assert_eq!(progress.module, "As");
                // Seeded [0,100) coalesces with the completed [100,200).
                assert_eq!(
                    progress.processed_ranges,
                    vec![BlockRange::new(0, 200), BlockRange::new(300, 400)]
                );
                assert_eq!(progress.available_up_to, Some(200));
                assert_eq!(progress.bytes_read, 11);
                assert_eq!(progress.bytes_written, 22);
            }
            other => panic!("expected module progress, got {other:?}"),
        }
        assert_eq!(
            events_rx.recv().await,
            Some(ProgressEvent::Finished(TerminalStatus::Completed))
        );

        reporter.await.unwrap();
    }

    #[tokio::test]
    async fn failures_emit_immediately() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (reporter, handle) = Reporter::new(
            Duration::from_secs(3600),
            std::iter::empty(),
            ready_rx,
            events_tx,
        );
        let reporter = tokio::spawn(reporter.run());

        handle.job_failed(&job("B", (0, 100)), "user code trapped".to_string());

        assert_eq!(
            events_rx.recv().await,
            Some(ProgressEvent::Failed {
                module: "B".to_string(),
                range: BlockRange::new(0, 100),
                reason: "user code trapped".to_string(),
            })
        );

        drop(handle);
        reporter.await.unwrap();
    }
}
