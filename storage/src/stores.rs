//! Worker-side store management: holds the partial stores a job is building
//! and flushes one fragment per crossed save-interval boundary.

use common::{BlockNum, Ranges, Store};

use crate::kv::{KvError, KvStore, StoreDelta};

/// Tracks the next save-interval boundary while a job walks its block range.
#[derive(Clone, Debug)]
pub struct StoreBoundary {
    interval: u64,
    next_boundary: BlockNum,
}

impl StoreBoundary {
    pub fn new(interval: u64, start_block: BlockNum) -> Self {
        let mut bound = StoreBoundary {
            interval,
            next_boundary: 0,
        };
        bound.init(start_block);
        bound
    }

    /// Positions the boundary strictly after `block`.
    pub fn init(&mut self, block: BlockNum) {
        self.next_boundary = block - block % self.interval + self.interval;
    }

    /// All flush points reached once processing is at `reached` (exclusive):
    /// every boundary up to it, plus `reached` itself when it is the job's
    /// stop block and does not land on a boundary.
    pub fn flush_ranges(&mut self, stop_block: BlockNum, reached: BlockNum) -> Vec<BlockNum> {
        let mut boundaries = Vec::new();
        while self.next_boundary <= reached {
            boundaries.push(self.next_boundary);
            self.next_boundary += self.interval;
        }
        if reached == stop_block && reached % self.interval != 0 {
            boundaries.push(stop_block);
        }
        boundaries
    }
}

/// The set of stores one job writes, keyed by module name.
pub struct Stores {
    bounder: StoreBoundary,
    stop_block: BlockNum,
    stores: Vec<Box<dyn KvStore>>,
    partials_written: Ranges,
    bytes_written: u64,
}

impl Stores {
    pub fn new(
        interval: u64,
        start_block: BlockNum,
        stop_block: BlockNum,
        stores: Vec<Box<dyn KvStore>>,
    ) -> Self {
        Stores {
            bounder: StoreBoundary::new(interval, start_block),
            stop_block,
            stores,
            partials_written: Ranges::default(),
            bytes_written: 0,
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn KvStore + '_)> {
        for s in self.stores.iter_mut() {
            if s.name() == name {
                return Some(&mut **s);
            }
        }
        None
    }

    /// Block ranges persisted so far, reported back to the orchestrator when
    /// the job completes.
    pub fn partials_written(&self) -> &Ranges {
        &self.partials_written
    }

    /// Total bytes persisted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes every boundary crossed by advancing to `reached` (exclusive
    /// end of the blocks processed so far). Persists each store's fragment
    /// and rolls it forward.
    pub async fn flush(&mut self, data_store: &Store, reached: BlockNum) -> Result<(), KvError> {
        let boundaries = self.bounder.flush_ranges(self.stop_block, reached);
        if !boundaries.is_empty() {
            tracing::debug!(boundaries = ?boundaries, "flushing store boundaries");
        }
        for boundary in boundaries {
            self.save_snapshots(data_store, boundary).await?;
        }
        Ok(())
    }

    async fn save_snapshots(&mut self, data_store: &Store, boundary: BlockNum) -> Result<(), KvError> {
        for store in &mut self.stores {
            if boundary <= store.initial_block() {
                // This store has accumulated nothing below the boundary yet.
                continue;
            }
            let saved = store.save(data_store, boundary).await?;
            tracing::debug!(
                module = store.name(),
                file = %saved.file,
                "wrote partial fragment"
            );
            self.bytes_written += saved.bytes_written;
            // Fragments are written left to right; overlap cannot happen.
            self.partials_written.insert(saved.file.range).unwrap();
            if let Some(rollable) = store.as_rollable() {
                rollable.roll(boundary);
            }
        }
        Ok(())
    }

    /// Rolls back one block's worth of deltas on the named store, for undo
    /// handling while streaming.
    pub fn handle_undo(&mut self, module: &str, deltas: &[StoreDelta]) {
        if let Some(store) = self.get_mut(module) {
            if let Some(accessor) = store.as_delta_accessor() {
                accessor.apply_deltas_reverse(deltas);
            }
        }
    }

    /// Clears per-block delta logs once their content has been handed off.
    pub fn reset_stores(&mut self) {
        for store in &mut self.stores {
            if let Some(resettable) = store.as_resettable() {
                resettable.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use common::Store;

    use super::{StoreBoundary, Stores};
    use crate::kv::{KvStore, StoreConfig, UpdatePolicy};

    #[test]
    fn boundary_progression() {
        let mut bounder = StoreBoundary::new(10, 85);
        assert_eq!(bounder.flush_ranges(105, 89), Vec::<u64>::new());
        assert_eq!(bounder.flush_ranges(105, 90), vec![90]);
        assert_eq!(bounder.flush_ranges(105, 91), Vec::<u64>::new());
        // Skipping several boundaries at once flushes each of them.
        assert_eq!(bounder.flush_ranges(105, 120), vec![100, 110, 120]);
        // The stop block gets a final flush even off-boundary.
        let mut bounder = StoreBoundary::new(10, 100);
        assert_eq!(bounder.flush_ranges(105, 105), vec![105]);
    }

    #[test]
    fn boundary_init_on_aligned_block() {
        let mut bounder = StoreBoundary::new(10, 100);
        // The boundary at the start block itself is not a flush point.
        assert_eq!(bounder.flush_ranges(200, 100), Vec::<u64>::new());
        assert_eq!(bounder.flush_ranges(200, 110), vec![110]);
    }

    fn test_store(name: &str, start: u64) -> Box<dyn KvStore> {
        let config = StoreConfig {
            name: name.to_string(),
            module_hash: format!("hash-{name}"),
            module_initial_block: 0,
            update_policy: UpdatePolicy::Set,
        };
        Box::new(config.new_partial(start))
    }

    #[tokio::test]
    async fn flush_writes_one_fragment_per_boundary() {
        let data_store = Store::in_memory();
        let mut stores = Stores::new(10, 0, 25, vec![test_store("As", 0)]);

        for block in 0u64..25 {
            stores.flush(&data_store, block + 1).await.unwrap();
        }

        assert_eq!(stores.partials_written().to_string(), "0-10,10-20,20-25");
        assert!(stores.bytes_written() > 0);
        for file in ["hash-As/0-10.partial", "hash-As/10-20.partial", "hash-As/20-25.partial"] {
            data_store.get_bytes(file).await.unwrap();
        }
    }

    #[tokio::test]
    async fn undo_and_reset_go_through_capabilities() {
        let data_store = Store::in_memory();
        let mut stores = Stores::new(10, 0, 20, vec![test_store("As", 0)]);

        let store = stores.get_mut("As").unwrap();
        let accessor = store.as_delta_accessor().unwrap();
        accessor.apply_deltas(&[crate::kv::StoreDelta {
            operation: crate::kv::DeltaOperation::Create,
            ordinal: 1,
            key: "a".to_string(),
            old_value: None,
            new_value: Some(b"1".to_vec()),
        }]);

        stores.handle_undo(
            "As",
            &[crate::kv::StoreDelta {
                operation: crate::kv::DeltaOperation::Create,
                ordinal: 1,
                key: "a".to_string(),
                old_value: None,
                new_value: Some(b"1".to_vec()),
            }],
        );
        stores.reset_stores();

        stores.flush(&data_store, 20).await.unwrap();
        assert_eq!(stores.partials_written().to_string(), "0-10,10-20");
    }
}
