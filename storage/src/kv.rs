//! In-memory key-value store images and their persistence.
//!
//! A `FullKv` is the accumulating image of a store module from its initial
//! block up to some merged end; a `PartialKv` is the fragment a worker
//! produces over one segment-aligned range. Both share the same base:
//! policy-driven writes, an ordinal-stamped delta log, and a serde-encoded
//! snapshot format. Optional behaviors (delta replay, reset, rolling) are
//! discovered through capability queries on the `KvStore` trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use common::{BlockNum, BlockRange};
use serde::{Deserialize, Serialize};

use crate::snapshot::FileInfo;

/// How concurrent writes and cross-fragment merges combine values for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Last write wins.
    Set,
    /// First write wins.
    SetIfNotExists,
    /// Values are decimal integers; merge sums them.
    Add,
    /// Values are decimal integers; merge keeps the smallest.
    Min,
    /// Values are decimal integers; merge keeps the largest.
    Max,
    /// Merge concatenates the newer value after the older one.
    Append,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOperation {
    Create,
    Update,
    Delete,
}

/// One recorded mutation, replayable in both directions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDelta {
    pub operation: DeltaOperation,
    pub ordinal: u64,
    pub key: String,
    pub old_value: Option<Vec<u8>>,
    pub new_value: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("store {module}: {source}")]
    Storage {
        module: String,
        #[source]
        source: common::store::StoreError,
    },

    #[error("store {module}: snapshot {path} is not decodable: {source}")]
    Decode {
        module: String,
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store {module}: snapshot encoding failed: {source}")]
    Encode {
        module: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "store {module}: snapshot at {path} covers {found}, expected {expected}"
    )]
    RangeMismatch {
        module: String,
        path: String,
        expected: BlockRange,
        found: BlockRange,
    },

    #[error("store {module}: key {key:?} holds a non-integer value under policy {policy:?}")]
    MergeConflict {
        module: String,
        key: String,
        policy: UpdatePolicy,
    },
}

/// Identity and policy of one store module, from which images are built.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub name: String,
    pub module_hash: String,
    pub module_initial_block: BlockNum,
    pub update_policy: UpdatePolicy,
}

impl StoreConfig {
    pub fn for_module(module: &crate::manifest::Module) -> Option<StoreConfig> {
        match &module.kind {
            crate::manifest::ModuleKind::Store { update_policy } => Some(StoreConfig {
                name: module.name.clone(),
                module_hash: module.hash.clone(),
                module_initial_block: module.initial_block,
                update_policy: *update_policy,
            }),
            crate::manifest::ModuleKind::Map => None,
        }
    }

    /// An empty complete image starting at the module's initial block.
    pub fn new_full(&self) -> FullKv {
        FullKv {
            base: BaseKv::new(self.clone()),
        }
    }

    /// An empty fragment whose accumulation starts at `initial_block`.
    pub fn new_partial(&self, initial_block: BlockNum) -> PartialKv {
        PartialKv {
            base: BaseKv::new(self.clone()),
            fragment_start: initial_block,
        }
    }

    /// Loads a complete snapshot covering exactly `range`.
    pub async fn load_full(
        &self,
        store: &common::Store,
        range: BlockRange,
    ) -> Result<FullKv, KvError> {
        let file = FileInfo::complete(range.start_block, range.exclusive_end_block);
        let base = BaseKv::load(self.clone(), store, &file, range).await?;
        Ok(FullKv { base })
    }

    /// Loads a partial fragment covering exactly `range`.
    pub async fn load_partial(
        &self,
        store: &common::Store,
        range: BlockRange,
    ) -> Result<PartialKv, KvError> {
        let file = FileInfo::partial(range);
        let base = BaseKv::load(self.clone(), store, &file, range).await?;
        Ok(PartialKv {
            base,
            fragment_start: range.start_block,
        })
    }
}

/// Replay of recorded deltas, forward (apply) or backward (undo).
pub trait DeltaAccessor {
    fn apply_deltas(&mut self, deltas: &[StoreDelta]);
    fn apply_deltas_reverse(&mut self, deltas: &[StoreDelta]);
}

/// Clearing of the per-block delta log once it has been handed off.
pub trait Resettable {
    fn reset(&mut self);
}

/// Re-basing of a fragment once it has been persisted at a boundary.
pub trait Rollable {
    fn roll(&mut self, boundary: BlockNum);
}

/// The uniform surface of a store image, with optional capabilities
/// discovered at call sites.
#[async_trait]
pub trait KvStore: Send {
    fn name(&self) -> &str;
    fn initial_block(&self) -> BlockNum;

    /// Persist the image as a file ending at `boundary`, returning what was
    /// written.
    async fn save(&self, store: &common::Store, boundary: BlockNum) -> Result<SavedFile, KvError>;

    fn as_delta_accessor(&mut self) -> Option<&mut dyn DeltaAccessor> {
        None
    }
    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        None
    }
    fn as_rollable(&mut self) -> Option<&mut dyn Rollable> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct SavedFile {
    pub file: FileInfo,
    pub bytes_written: u64,
}

/// Wire format of both snapshot kinds. The byte-level encoding is not part
/// of the orchestration contract; any stable encoding works here.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    module: String,
    update_policy: UpdatePolicy,
    range: BlockRange,
    kv: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone, Debug)]
struct BaseKv {
    config: StoreConfig,
    kv: BTreeMap<String, Vec<u8>>,
    deltas: Vec<StoreDelta>,
    last_ordinal: u64,
}

impl BaseKv {
    fn new(config: StoreConfig) -> Self {
        BaseKv {
            config,
            kv: BTreeMap::new(),
            deltas: Vec::new(),
            last_ordinal: 0,
        }
    }

    async fn load(
        config: StoreConfig,
        store: &common::Store,
        file: &FileInfo,
        expected: BlockRange,
    ) -> Result<BaseKv, KvError> {
        let path = file.path(&config.module_hash);
        let bytes = store
            .get_bytes(path.as_str())
            .await
            .map_err(|source| KvError::Storage {
                module: config.name.clone(),
                source,
            })?;
        let payload: SnapshotPayload =
            serde_json::from_slice(&bytes).map_err(|source| KvError::Decode {
                module: config.name.clone(),
                path: path.clone(),
                source,
            })?;
        if payload.range != expected {
            return Err(KvError::RangeMismatch {
                module: config.name.clone(),
                path,
                expected,
                found: payload.range,
            });
        }
        Ok(BaseKv {
            config,
            kv: payload.kv,
            deltas: Vec::new(),
            last_ordinal: 0,
        })
    }

    async fn save(
        &self,
        store: &common::Store,
        file: FileInfo,
        range: BlockRange,
    ) -> Result<SavedFile, KvError> {
        let payload = SnapshotPayload {
            module: self.config.name.clone(),
            update_policy: self.config.update_policy,
            range,
            kv: self.kv.clone(),
        };
        let encoded = serde_json::to_vec(&payload).map_err(|source| KvError::Encode {
            module: self.config.name.clone(),
            source,
        })?;
        let bytes_written = encoded.len() as u64;
        store
            .put_bytes(file.path(&self.config.module_hash).as_str(), Bytes::from(encoded))
            .await
            .map_err(|source| KvError::Storage {
                module: self.config.name.clone(),
                source,
            })?;
        Ok(SavedFile {
            file,
            bytes_written,
        })
    }

    fn bump_ordinal(&mut self, ordinal: u64) {
        debug_assert!(ordinal >= self.last_ordinal, "ordinals must not regress");
        self.last_ordinal = ordinal;
    }

    fn record(&mut self, delta: StoreDelta) {
        self.apply(&delta);
        self.deltas.push(delta);
    }

    fn apply(&mut self, delta: &StoreDelta) {
        match delta.operation {
            DeltaOperation::Create | DeltaOperation::Update => {
                let value = delta.new_value.clone().unwrap_or_default();
                self.kv.insert(delta.key.clone(), value);
            }
            DeltaOperation::Delete => {
                self.kv.remove(&delta.key);
            }
        }
    }

    fn set(&mut self, ordinal: u64, key: &str, value: &[u8]) {
        self.bump_ordinal(ordinal);
        let old_value = self.kv.get(key).cloned();
        let operation = if old_value.is_some() {
            DeltaOperation::Update
        } else {
            DeltaOperation::Create
        };
        self.record(StoreDelta {
            operation,
            ordinal,
            key: key.to_string(),
            old_value,
            new_value: Some(value.to_vec()),
        });
    }

    fn set_if_not_exists(&mut self, ordinal: u64, key: &str, value: &[u8]) {
        if self.kv.contains_key(key) {
            return;
        }
        self.set(ordinal, key, value);
    }

    fn delete_prefix(&mut self, ordinal: u64, prefix: &str) {
        self.bump_ordinal(ordinal);

        let keys: Vec<String> = self
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        // BTreeMap iteration hands the keys back sorted, so the recorded
        // deltas are key-ordered.
        for key in keys {
            let old_value = self.kv.get(&key).cloned();
            self.record(StoreDelta {
                operation: DeltaOperation::Delete,
                ordinal,
                key,
                old_value,
                new_value: None,
            });
        }
    }
}

impl DeltaAccessor for BaseKv {
    fn apply_deltas(&mut self, deltas: &[StoreDelta]) {
        for delta in deltas {
            self.apply(delta);
        }
    }

    fn apply_deltas_reverse(&mut self, deltas: &[StoreDelta]) {
        for delta in deltas.iter().rev() {
            match delta.operation {
                DeltaOperation::Create => {
                    self.kv.remove(&delta.key);
                }
                DeltaOperation::Update | DeltaOperation::Delete => {
                    let value = delta.old_value.clone().unwrap_or_default();
                    self.kv.insert(delta.key.clone(), value);
                }
            }
        }
    }
}

impl Resettable for BaseKv {
    fn reset(&mut self) {
        self.deltas.clear();
        self.last_ordinal = 0;
    }
}

/// The accumulating complete image of one store module.
#[derive(Clone, Debug)]
pub struct FullKv {
    base: BaseKv,
}

impl FullKv {
    pub fn module_hash(&self) -> &str {
        &self.base.config.module_hash
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.base.kv.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.base.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.kv.is_empty()
    }

    /// Merges a fragment into this image under the configured update policy.
    /// The fragment's contiguity with the image is the squasher's concern,
    /// not checked here.
    pub fn merge(&mut self, partial: &PartialKv) -> Result<(), KvError> {
        let policy = self.base.config.update_policy;
        for (key, theirs) in &partial.base.kv {
            match policy {
                UpdatePolicy::Set => {
                    self.base.kv.insert(key.clone(), theirs.clone());
                }
                UpdatePolicy::SetIfNotExists => {
                    self.base.kv.entry(key.clone()).or_insert_with(|| theirs.clone());
                }
                UpdatePolicy::Add => {
                    let sum = match self.base.kv.get(key) {
                        Some(ours) => {
                            self.parse_int(key, ours)? + self.parse_int(key, theirs)?
                        }
                        None => self.parse_int(key, theirs)?,
                    };
                    self.base.kv.insert(key.clone(), sum.to_string().into_bytes());
                }
                UpdatePolicy::Min | UpdatePolicy::Max => {
                    let keep = match self.base.kv.get(key) {
                        Some(ours) => {
                            let ours = self.parse_int(key, ours)?;
                            let theirs = self.parse_int(key, theirs)?;
                            if policy == UpdatePolicy::Min {
                                ours.min(theirs)
                            } else {
                                ours.max(theirs)
                            }
                        }
                        None => self.parse_int(key, theirs)?,
                    };
                    self.base.kv.insert(key.clone(), keep.to_string().into_bytes());
                }
                UpdatePolicy::Append => {
                    self.base
                        .kv
                        .entry(key.clone())
                        .or_default()
                        .extend_from_slice(theirs);
                }
            }
        }
        Ok(())
    }

    fn parse_int(&self, key: &str, value: &[u8]) -> Result<i128, KvError> {
        std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.parse::<i128>().ok())
            .ok_or_else(|| KvError::MergeConflict {
                module: self.base.config.name.clone(),
                key: key.to_string(),
                policy: self.base.config.update_policy,
            })
    }
}

#[async_trait]
impl KvStore for FullKv {
    fn name(&self) -> &str {
        &self.base.config.name
    }

    fn initial_block(&self) -> BlockNum {
        self.base.config.module_initial_block
    }

    /// Persists the complete snapshot `{module_initial_block}-{boundary}.kv`.
    async fn save(&self, store: &common::Store, boundary: BlockNum) -> Result<SavedFile, KvError> {
        let range = BlockRange::new(self.base.config.module_initial_block, boundary);
        let file = FileInfo::complete(range.start_block, range.exclusive_end_block);
        self.base.save(store, file, range).await
    }

    fn as_delta_accessor(&mut self) -> Option<&mut dyn DeltaAccessor> {
        Some(&mut self.base)
    }
}

/// One store module's fragment over a segment-aligned range, as produced by
/// a worker.
#[derive(Clone, Debug)]
pub struct PartialKv {
    base: BaseKv,
    /// Where this fragment's accumulation began; rolls forward at every
    /// persisted boundary.
    fragment_start: BlockNum,
}

impl PartialKv {
    pub fn fragment_start(&self) -> BlockNum {
        self.fragment_start
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.base.kv.get(key).map(Vec::as_slice)
    }

    pub fn set(&mut self, ordinal: u64, key: &str, value: &[u8]) {
        self.base.set(ordinal, key, value);
    }

    pub fn set_if_not_exists(&mut self, ordinal: u64, key: &str, value: &[u8]) {
        self.base.set_if_not_exists(ordinal, key, value);
    }

    pub fn delete_prefix(&mut self, ordinal: u64, prefix: &str) {
        self.base.delete_prefix(ordinal, prefix);
    }

    pub fn deltas(&self) -> &[StoreDelta] {
        &self.base.deltas
    }
}

#[async_trait]
impl KvStore for PartialKv {
    fn name(&self) -> &str {
        &self.base.config.name
    }

    fn initial_block(&self) -> BlockNum {
        self.fragment_start
    }

    /// Persists the fragment `{fragment_start}-{boundary}.partial`.
    async fn save(&self, store: &common::Store, boundary: BlockNum) -> Result<SavedFile, KvError> {
        let range = BlockRange::new(self.fragment_start, boundary);
        let file = FileInfo::partial(range);
        self.base.save(store, file, range).await
    }

    fn as_delta_accessor(&mut self) -> Option<&mut dyn DeltaAccessor> {
        Some(&mut self.base)
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        Some(&mut self.base)
    }

    fn as_rollable(&mut self) -> Option<&mut dyn Rollable> {
        Some(self)
    }
}

impl Rollable for PartialKv {
    /// Clears the fragment and restarts its accumulation at `boundary`.
    fn roll(&mut self, boundary: BlockNum) {
        self.fragment_start = boundary;
        self.base.kv.clear();
        self.base.deltas.clear();
        self.base.last_ordinal = 0;
    }
}

/// Deletes a partial fragment file; the inverse of `PartialKv::save`.
pub async fn delete_partial(
    store: &common::Store,
    module_hash: &str,
    range: BlockRange,
) -> Result<(), common::store::StoreError> {
    let file = FileInfo::partial(range);
    store.delete(file.path(module_hash).as_str()).await
}

#[cfg(test)]
mod tests {
    use common::{BlockRange, Store};

    use super::{DeltaOperation, KvError, KvStore as _, StoreConfig, UpdatePolicy};

    fn config(policy: UpdatePolicy) -> StoreConfig {
        StoreConfig {
            name: "As".to_string(),
            module_hash: "abc123".to_string(),
            module_initial_block: 0,
            update_policy: policy,
        }
    }

    #[test]
    fn merge_policies() {
        let mk_partial = |policy, entries: &[(&str, &str)]| {
            let mut partial = config(policy).new_partial(100);
            for (i, (k, v)) in entries.iter().enumerate() {
                partial.set(i as u64, k, v.as_bytes());
            }
            partial
        };

        // Set: last write wins.
        let mut full = config(UpdatePolicy::Set).new_full();
        full.merge(&mk_partial(UpdatePolicy::Set, &[("a", "1")])).unwrap();
        full.merge(&mk_partial(UpdatePolicy::Set, &[("a", "2")])).unwrap();
        assert_eq!(full.get("a"), Some("2".as_bytes()));

        // SetIfNotExists: first write wins.
        let mut full = config(UpdatePolicy::SetIfNotExists).new_full();
        full.merge(&mk_partial(UpdatePolicy::SetIfNotExists, &[("a", "1")]))
            .unwrap();
        full.merge(&mk_partial(UpdatePolicy::SetIfNotExists, &[("a", "2"), ("b", "3")]))
            .unwrap();
        assert_eq!(full.get("a"), Some("1".as_bytes()));
        assert_eq!(full.get("b"), Some("3".as_bytes()));

        // Add sums decimal integers.
        let mut full = config(UpdatePolicy::Add).new_full();
        full.merge(&mk_partial(UpdatePolicy::Add, &[("a", "40")])).unwrap();
        full.merge(&mk_partial(UpdatePolicy::Add, &[("a", "2")])).unwrap();
        assert_eq!(full.get("a"), Some("42".as_bytes()));

        // Min / Max.
        let mut full = config(UpdatePolicy::Min).new_full();
        full.merge(&mk_partial(UpdatePolicy::Min, &[("a", "40")])).unwrap();
        full.merge(&mk_partial(UpdatePolicy::Min, &[("a", "2")])).unwrap();
        assert_eq!(full.get("a"), Some("2".as_bytes()));

        let mut full = config(UpdatePolicy::Max).new_full();
        full.merge(&mk_partial(UpdatePolicy::Max, &[("a", "40")])).unwrap();
        full.merge(&mk_partial(UpdatePolicy::Max, &[("a", "2")])).unwrap();
        assert_eq!(full.get("a"), Some("40".as_bytes()));

        // Append concatenates.
        let mut full = config(UpdatePolicy::Append).new_full();
        full.merge(&mk_partial(UpdatePolicy::Append, &[("a", "x")])).unwrap();
        full.merge(&mk_partial(UpdatePolicy::Append, &[("a", "y")])).unwrap();
        assert_eq!(full.get("a"), Some("xy".as_bytes()));
    }

    #[test]
    fn numeric_merge_rejects_garbage() {
        let mut full = config(UpdatePolicy::Add).new_full();
        let mut partial = config(UpdatePolicy::Add).new_partial(0);
        partial.set(0, "a", b"not-a-number");
        assert!(matches!(
            full.merge(&partial),
            Err(KvError::MergeConflict { .. })
        ));
    }

    #[test]
    fn delete_prefix_records_sorted_deltas() {
        let mut partial = config(UpdatePolicy::Set).new_partial(0);
        partial.set(1, "user:b", b"1");
        partial.set(2, "user:a", b"2");
        partial.set(3, "other", b"3");

        partial.delete_prefix(4, "user:");

        assert_eq!(partial.get("user:a"), None);
        assert_eq!(partial.get("user:b"), None);
        assert_eq!(partial.get("other"), Some("3".as_bytes()));

        let deletes: Vec<&str> = partial
            .deltas()
            .iter()
            .filter(|d| d.operation == DeltaOperation::Delete)
            .map(|d| d.key.as_str())
            .collect();
        assert_eq!(deletes, vec!["user:a", "user:b"]);
    }

    #[test]
    fn reverse_deltas_undo_a_block() {
        let mut partial = config(UpdatePolicy::Set).new_partial(0);
        partial.set(1, "a", b"old");

        let before = partial.deltas().len();
        partial.set(2, "a", b"new");
        partial.set(3, "b", b"created");
        partial.delete_prefix(4, "a");

        let undo: Vec<_> = partial.deltas()[before..].to_vec();
        partial.as_delta_accessor().unwrap().apply_deltas_reverse(&undo);

        assert_eq!(partial.get("a"), Some("old".as_bytes()));
        assert_eq!(partial.get("b"), None);
    }

    #[tokio::test]
    async fn save_load_round_trip_and_roll() {
        let store = Store::in_memory();
        let config = config(UpdatePolicy::Set);

        let mut partial = config.new_partial(100);
        partial.set(1, "a", b"1");
        let saved = partial.save(&store, 200).await.unwrap();
        assert_eq!(saved.file.filename, "100-200.partial");
        assert!(saved.bytes_written > 0);

        partial.as_rollable().unwrap().roll(200);
        assert_eq!(partial.fragment_start(), 200);
        assert_eq!(partial.get("a"), None);

        let loaded = config
            .load_partial(&store, BlockRange::new(100, 200))
            .await
            .unwrap();
        assert_eq!(loaded.get("a"), Some("1".as_bytes()));

        // A complete snapshot loads back under its own name.
        let mut full = config.new_full();
        full.merge(&loaded).unwrap();
        full.save(&store, 200).await.unwrap();
        let full = config.load_full(&store, BlockRange::new(0, 200)).await.unwrap();
        assert_eq!(full.get("a"), Some("1".as_bytes()));

        // Loading a snapshot under the wrong range is an error.
        let err = config
            .load_full(&store, BlockRange::new(0, 300))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Storage { .. }));

        // A snapshot whose payload disagrees with its file name is corrupt.
        let good = store.get_bytes("abc123/0-200.kv").await.unwrap();
        store.put_bytes("abc123/0-300.kv", good).await.unwrap();
        let err = config
            .load_full(&store, BlockRange::new(0, 300))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::RangeMismatch { .. }));

        super::delete_partial(&store, &config.module_hash, BlockRange::new(100, 200))
            .await
            .unwrap();
        config
            .load_partial(&store, BlockRange::new(100, 200))
            .await
            .unwrap_err();
    }
}
