//! The squasher produces complete store snapshots by merging the partial
//! fragments workers leave in durable storage, strictly in block order.

use std::{collections::BTreeMap, fmt, sync::Arc};

use common::{BlockNum, BlockRange, Ranges, Store};
use storage::{
    kv::{self, FullKv, KvError, KvStore as _, StoreConfig},
    state::ModuleStateMap,
};
use tokio::sync::Mutex;

use crate::{metrics::Metrics, notifier::Notifier};

#[derive(Debug, thiserror::Error)]
pub enum SquashError {
    #[error("module {0:?} was not found in the squashable registry")]
    UnknownModule(String),

    #[error(
        "module {module}: squash request for {range} starts before the module's initial block {initial_block}"
    )]
    StartBeforeInitialBlock {
        module: String,
        range: BlockRange,
        initial_block: BlockNum,
    },

    #[error("module {module}: fragment {range} conflicts with pending fragments {pending}")]
    ConflictingFragment {
        module: String,
        range: BlockRange,
        pending: String,
    },

    #[error("module {module}: loading complete snapshot {range}: {source}")]
    LoadSnapshot {
        module: String,
        range: BlockRange,
        #[source]
        source: KvError,
    },

    #[error("module {module}: loading fragment {range}: {source}")]
    LoadFragment {
        module: String,
        range: BlockRange,
        #[source]
        source: KvError,
    },

    #[error("module {module}: merging fragment {range}: {source}")]
    Merge {
        module: String,
        range: BlockRange,
        #[source]
        source: KvError,
    },

    #[error("module {module}: writing complete snapshot at {boundary}: {source}")]
    WriteSnapshot {
        module: String,
        boundary: BlockNum,
        #[source]
        source: KvError,
    },

    #[error("stores not ready: {0}")]
    NotReady(String),
}

/// Produces complete stores by merging backing partial fragments. One
/// independent `Squashable` per store module, each behind its own lock.
pub struct Squasher {
    squashables: BTreeMap<String, Mutex<Squashable>>,
}

impl Squasher {
    /// Seeds one squashable per probed store module. Modules with a complete
    /// snapshot on disk start from its loaded image; the rest start from an
    /// empty image at the module's initial block.
    pub async fn new(
        data_store: Arc<Store>,
        states: &ModuleStateMap,
        save_interval: u64,
        target_exclusive_block: BlockNum,
        notifier: Arc<Notifier>,
        metrics: Arc<Metrics>,
    ) -> Result<Squasher, SquashError> {
        let mut squashables = BTreeMap::new();
        for (name, state) in states {
            let config = StoreConfig {
                name: state.module_name.clone(),
                module_hash: state.module_hash.clone(),
                module_initial_block: state.module_initial_block,
                update_policy: state.update_policy,
            };

            let store = match &state.initial_complete_file {
                Some(file) => config
                    .load_full(&data_store, file.range)
                    .await
                    .map_err(|source| SquashError::LoadSnapshot {
                        module: name.clone(),
                        range: file.range,
                        source,
                    })?,
                None => config.new_full(),
            };

            let next_expected_start_block = state.base_end();
            squashables.insert(
                name.clone(),
                Mutex::new(Squashable {
                    config,
                    store,
                    data_store: data_store.clone(),
                    save_interval,
                    target_exclusive_block,
                    next_expected_start_block,
                    pending: Ranges::default(),
                    target_reached: next_expected_start_block >= target_exclusive_block,
                    notifier: notifier.clone(),
                    metrics: metrics.clone(),
                }),
            );
        }
        Ok(Squasher { squashables })
    }

    /// The write path invoked when a worker reports success (and at startup
    /// for fragments already on disk).
    pub async fn squash(&self, module: &str, range: BlockRange) -> Result<(), SquashError> {
        let squashable = self
            .squashables
            .get(module)
            .ok_or_else(|| SquashError::UnknownModule(module.to_string()))?;
        squashable.lock().await.squash(range).await
    }

    /// `Ok` iff every store reached the target with nothing left pending;
    /// otherwise a description of what is missing where.
    pub async fn stores_ready(&self) -> Result<(), SquashError> {
        let mut problems = Vec::new();
        for (name, squashable) in &self.squashables {
            let squashable = squashable.lock().await;
            if !squashable.target_reached {
                problems.push(format!(
                    "module {name:?} not reached target, next expected start {}",
                    squashable.next_expected_start_block
                ));
            }
            if !squashable.pending.is_empty() {
                problems.push(format!(
                    "module {name:?} has unmerged fragments {}",
                    squashable.pending
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SquashError::NotReady(problems.join("; ")))
        }
    }
}

struct Squashable {
    config: StoreConfig,
    store: FullKv,
    data_store: Arc<Store>,
    save_interval: u64,
    target_exclusive_block: BlockNum,

    /// Only a fragment starting exactly here may merge next (contiguity).
    next_expected_start_block: BlockNum,
    /// Fragments that arrived out of order, sorted, waiting for their turn.
    pending: Ranges,
    target_reached: bool,

    notifier: Arc<Notifier>,
    metrics: Arc<Metrics>,
}

impl Squashable {
    async fn squash(&mut self, range: BlockRange) -> Result<(), SquashError> {
        tracing::debug!(module = %self.config.name, range = %range, "squashing request range");

        for sub in range.split(self.save_interval) {
            if sub.start_block < self.config.module_initial_block {
                return Err(SquashError::StartBeforeInitialBlock {
                    module: self.config.name.clone(),
                    range: sub,
                    initial_block: self.config.module_initial_block,
                });
            }
            if sub.exclusive_end_block <= self.next_expected_start_block {
                // Already merged; a retried worker re-reported it.
                tracing::debug!(
                    module = %self.config.name,
                    range = %sub,
                    "dropping already-merged fragment"
                );
                continue;
            }
            if self.pending.as_slice().contains(&sub) {
                // Exact duplicate of a buffered fragment.
                continue;
            }
            self.pending
                .insert(sub)
                .map_err(|_| SquashError::ConflictingFragment {
                    module: self.config.name.clone(),
                    range: sub,
                    pending: self.pending.to_string(),
                })?;
        }

        self.merge_available_fragments().await
    }

    /// Drains the pending list while its head is contiguous with the merged
    /// image, persisting a complete snapshot at every save-interval boundary.
    async fn merge_available_fragments(&mut self) -> Result<(), SquashError> {
        while let Some(head) = self.pending.first().copied() {
            if head.start_block != self.next_expected_start_block {
                break;
            }

            tracing::debug!(squashable = %self, range = %head, "merging fragment");
            let fragment = self
                .config
                .load_partial(&self.data_store, head)
                .await
                .map_err(|source| SquashError::LoadFragment {
                    module: self.config.name.clone(),
                    range: head,
                    source,
                })?;
            self.store
                .merge(&fragment)
                .map_err(|source| SquashError::Merge {
                    module: self.config.name.clone(),
                    range: head,
                    source,
                })?;
            self.next_expected_start_block = head.exclusive_end_block;

            let end = head.exclusive_end_block;
            let on_boundary = end % self.save_interval == 0;
            if on_boundary {
                self.store
                    .save(&self.data_store, end)
                    .await
                    .map_err(|source| SquashError::WriteSnapshot {
                        module: self.config.name.clone(),
                        boundary: end,
                        source,
                    })?;
                self.metrics.snapshots_persisted.inc();
                tracing::info!(
                    module = %self.config.name,
                    up_to_block = end,
                    "complete snapshot persisted"
                );
            }

            // The merged fragment is now redundant either way: its content
            // lives in the in-memory image and, on a boundary, in the new
            // complete snapshot.
            if let Err(err) =
                kv::delete_partial(&self.data_store, &self.config.module_hash, head).await
            {
                tracing::warn!(
                    module = %self.config.name,
                    range = %head,
                    error = %err,
                    "deleting merged partial fragment failed"
                );
            }

            self.pending.pop_first();

            if end >= self.target_exclusive_block {
                self.target_reached = true;
            }
            if on_boundary || self.target_reached {
                self.notifier.notify(&self.config.name, end);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Squashable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reached = if self.target_reached {
            " (target reached)"
        } else {
            ""
        };
        write!(f, "{}{}: [{}]", self.config.name, reached, self.pending)
    }
}
