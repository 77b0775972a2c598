//! The storage state probe: given what durable storage already holds for a
//! store module, decide what still needs computing to reach the request's
//! start block.

use std::collections::BTreeMap;

use common::{BlockNum, BlockRange, Ranges, Segmenter};

use crate::{
    kv::UpdatePolicy,
    manifest::Module,
    snapshot::{FileInfo, Snapshots},
};

pub type ModuleStateMap = BTreeMap<String, StoreStorageState>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(
        "module {module}: partial fragment {fragment} straddles the complete snapshot end {base_end}"
    )]
    PartialOverlapsComplete {
        module: String,
        fragment: BlockRange,
        base_end: BlockNum,
    },

    #[error("module {module}: partial fragments overlap each other: {source}")]
    OverlappingPartials {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module {0:?} is not a store module, it has no storage state")]
    NotAStoreModule(String),
}

/// Per store module, what exists on disk and what is missing for the request.
#[derive(Clone, Debug)]
pub struct StoreStorageState {
    pub module_name: String,
    pub module_hash: String,
    pub module_initial_block: BlockNum,
    pub update_policy: UpdatePolicy,

    /// The latest complete snapshot usable as a base, absent when nothing
    /// complete is on disk. Absence is distinct from "complete up to block
    /// 0"; no sentinel value is ever used.
    pub initial_complete_file: Option<FileInfo>,

    /// Fragments already on disk that the squasher can merge without any
    /// worker involvement.
    pub partials_present: Ranges,

    /// Segment-aligned ranges that must still be computed.
    pub partials_missing: Ranges,
}

impl StoreStorageState {
    /// Classifies a module's snapshot listing against the request start.
    /// Pure; the listing itself is the only storage access, done upstream.
    pub fn probe(
        module: &Module,
        snapshots: &Snapshots,
        request_start: BlockNum,
        save_interval: u64,
    ) -> Result<StoreStorageState, StateError> {
        let update_policy = match &module.kind {
            crate::manifest::ModuleKind::Store { update_policy } => *update_policy,
            crate::manifest::ModuleKind::Map => {
                return Err(StateError::NotAStoreModule(module.name.clone()))
            }
        };

        let initial_complete_file = snapshots
            .last_complete_snapshot_before(request_start)
            .filter(|f| f.range.start_block == module.initial_block)
            .cloned();
        let base_end = initial_complete_file
            .as_ref()
            .map(|f| f.range.exclusive_end_block)
            .unwrap_or(module.initial_block);

        let mut present = Ranges::default();
        for file in &snapshots.partials {
            let range = file.range;
            if range.exclusive_end_block <= base_end || range.start_block >= request_start {
                // Subsumed by the complete snapshot, or beyond the request:
                // not our concern for this run.
                continue;
            }
            if range.start_block < base_end {
                return Err(StateError::PartialOverlapsComplete {
                    module: module.name.clone(),
                    fragment: range,
                    base_end,
                });
            }
            let range = if range.exclusive_end_block > request_start {
                // A fragment from a previous run with a later target; only
                // the part below the request start is mergeable.
                BlockRange::new(range.start_block, request_start)
            } else {
                range
            };
            present
                .insert(range)
                .map_err(|source| StateError::OverlappingPartials {
                    module: module.name.clone(),
                    source,
                })?;
        }

        let mut missing = Vec::new();
        if base_end < request_start {
            let segmenter = Segmenter::new(save_interval, base_end, request_start);
            for idx in 0..segmenter.count() {
                let Some(segment) = segmenter.range(idx) else {
                    continue;
                };
                if !present.covers(&segment) {
                    missing.push(segment);
                }
            }
        }

        Ok(StoreStorageState {
            module_name: module.name.clone(),
            module_hash: module.hash.clone(),
            module_initial_block: module.initial_block,
            update_policy,
            initial_complete_file,
            partials_present: present,
            // Segments are disjoint, so this cannot panic.
            partials_missing: missing.into_iter().collect(),
        })
    }

    /// The block everything before which is already covered by the complete
    /// snapshot (or the module's initial block when none exists).
    pub fn base_end(&self) -> BlockNum {
        self.initial_complete_file
            .as_ref()
            .map(|f| f.range.exclusive_end_block)
            .unwrap_or(self.module_initial_block)
    }

    /// Groups the missing segments into job-sized ranges: contiguous
    /// neighbours merge as long as the batch stays within
    /// `subrequest_split` blocks.
    pub fn batch_requests(&self, subrequest_split: u64) -> Vec<BlockRange> {
        let mut out: Vec<BlockRange> = Vec::new();
        for range in self.partials_missing.iter() {
            match out.last_mut() {
                Some(batch)
                    if batch.is_next_to(range)
                        && range.exclusive_end_block - batch.start_block <= subrequest_split =>
                {
                    batch.exclusive_end_block = range.exclusive_end_block;
                }
                _ => out.push(*range),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use common::{BlockRange, Ranges};

    use super::{StateError, StoreStorageState};
    use crate::{
        kv::UpdatePolicy,
        manifest::{Module, ModuleKind},
        snapshot::{FileInfo, Snapshots},
    };

    fn module(initial_block: u64) -> Module {
        Module {
            name: "As".to_string(),
            hash: "abc123".to_string(),
            kind: ModuleKind::Store {
                update_policy: UpdatePolicy::Set,
            },
            initial_block,
            inputs: vec![],
        }
    }

    fn state(state: &StoreStorageState) -> (Option<(u64, u64)>, String, String) {
        let complete = state
            .initial_complete_file
            .as_ref()
            .map(|f| (f.range.start_block, f.range.exclusive_end_block));
        (
            complete,
            state.partials_present.to_string(),
            state.partials_missing.to_string(),
        )
    }

    #[test]
    fn fresh_store_is_all_missing() {
        let probed =
            StoreStorageState::probe(&module(0), &Snapshots::default(), 85, 10).unwrap();
        assert_eq!(
            state(&probed),
            (None, "".to_string(), "0-10,10-20,20-30,30-40,40-50,50-60,60-70,70-80,80-85".to_string())
        );
        assert_eq!(probed.base_end(), 0);
    }

    #[test]
    fn unaligned_initial_block_starts_the_first_segment() {
        let probed =
            StoreStorageState::probe(&module(5), &Snapshots::default(), 35, 10).unwrap();
        assert_eq!(probed.partials_missing.to_string(), "5-10,10-20,20-30,30-35");
    }

    #[test]
    fn complete_snapshot_and_present_partial_reduce_missing() {
        let snapshots = Snapshots {
            completes: vec![FileInfo::complete(0, 500)],
            partials: vec![FileInfo::partial(BlockRange::new(500, 600))],
        };
        let probed = StoreStorageState::probe(&module(0), &snapshots, 700, 100).unwrap();
        assert_eq!(
            state(&probed),
            (
                Some((0, 500)),
                "500-600".to_string(),
                "600-700".to_string()
            )
        );
        assert_eq!(probed.base_end(), 500);
    }

    #[test]
    fn stale_and_future_partials_are_ignored() {
        let snapshots = Snapshots {
            completes: vec![FileInfo::complete(0, 500)],
            partials: vec![
                FileInfo::partial(BlockRange::new(300, 400)), // subsumed by complete
                FileInfo::partial(BlockRange::new(700, 800)), // beyond the request
            ],
        };
        let probed = StoreStorageState::probe(&module(0), &snapshots, 700, 100).unwrap();
        assert_eq!(
            state(&probed),
            (Some((0, 500)), "".to_string(), "500-600,600-700".to_string())
        );
    }

    #[test]
    fn partial_straddling_the_complete_end_is_fatal() {
        let snapshots = Snapshots {
            completes: vec![FileInfo::complete(0, 500)],
            partials: vec![FileInfo::partial(BlockRange::new(400, 600))],
        };
        let err = StoreStorageState::probe(&module(0), &snapshots, 700, 100).unwrap_err();
        assert!(matches!(err, StateError::PartialOverlapsComplete { .. }));
    }

    #[test]
    fn nothing_missing_when_complete_reaches_request_start() {
        let snapshots = Snapshots {
            completes: vec![FileInfo::complete(0, 700)],
            partials: vec![],
        };
        let probed = StoreStorageState::probe(&module(0), &snapshots, 700, 100).unwrap();
        assert_eq!(state(&probed), (Some((0, 700)), "".to_string(), "".to_string()));
    }

    #[test]
    fn complete_with_foreign_initial_block_is_not_a_base() {
        let snapshots = Snapshots {
            completes: vec![FileInfo::complete(100, 500)],
            partials: vec![],
        };
        let probed = StoreStorageState::probe(&module(0), &snapshots, 600, 100).unwrap();
        assert_eq!(probed.initial_complete_file, None);
        assert_eq!(probed.base_end(), 0);
    }

    #[test]
    fn batch_requests_merge_contiguous_up_to_split() {
        let mk = |missing: &str| StoreStorageState {
            module_name: "As".to_string(),
            module_hash: "abc123".to_string(),
            module_initial_block: 0,
            update_policy: UpdatePolicy::Set,
            initial_complete_file: None,
            partials_present: Ranges::default(),
            partials_missing: Ranges::parse(missing).unwrap(),
        };

        let batches = |missing: &str, split: u64| {
            mk(missing)
                .batch_requests(split)
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        assert_eq!(batches("0-10", 20), "0-10");
        assert_eq!(batches("0-10,10-20,30-40,40-50,50-60", 20), "0-20,30-50,50-60");
        assert_eq!(
            batches("0-10,10-20,20-30,30-40,40-50,50-60,60-70,70-80,80-85", 20),
            "0-20,20-40,40-60,60-80,80-85"
        );
        // Gaps always cut a batch, even under the size limit.
        assert_eq!(batches("0-10,20-30", 40), "0-10,20-30");
    }
}
