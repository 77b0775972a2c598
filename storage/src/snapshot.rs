//! Snapshot file naming and durable-storage inspection.
//!
//! Per store module, everything lives under the `<module_hash>/` prefix:
//! complete snapshots are `{initial_block}-{end}.kv`, partial fragments are
//! `{start}-{end}.partial`, with block numbers rendered in decimal.

use common::{BlockNum, BlockRange};

pub const COMPLETE_EXTENSION: &str = "kv";
pub const PARTIAL_EXTENSION: &str = "partial";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub range: BlockRange,
    pub partial: bool,
}

impl FileInfo {
    pub fn complete(initial_block: BlockNum, end: BlockNum) -> FileInfo {
        FileInfo {
            filename: format!("{initial_block}-{end}.{COMPLETE_EXTENSION}"),
            range: BlockRange::new(initial_block, end),
            partial: false,
        }
    }

    pub fn partial(range: BlockRange) -> FileInfo {
        FileInfo {
            filename: format!(
                "{}-{}.{}",
                range.start_block, range.exclusive_end_block, PARTIAL_EXTENSION
            ),
            range,
            partial: true,
        }
    }

    /// Parses `{start}-{end}.kv` / `{start}-{end}.partial`; anything else is
    /// `None`.
    pub fn parse(filename: &str) -> Option<FileInfo> {
        let (stem, extension) = filename.rsplit_once('.')?;
        let partial = match extension {
            COMPLETE_EXTENSION => false,
            PARTIAL_EXTENSION => true,
            _ => return None,
        };
        let range = BlockRange::parse(stem).ok()?;
        Some(FileInfo {
            filename: filename.to_string(),
            range,
            partial,
        })
    }

    /// The object path of this file for the given module.
    pub fn path(&self, module_hash: &str) -> String {
        format!("{module_hash}/{}", self.filename)
    }
}

impl std::fmt::Display for FileInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.filename)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("listing snapshots for module {module}: {source}")]
pub struct SnapshotError {
    pub module: String,
    #[source]
    pub source: common::store::StoreError,
}

/// What durable storage holds for one store module, split by file kind and
/// ordered by range.
#[derive(Clone, Debug, Default)]
pub struct Snapshots {
    pub completes: Vec<FileInfo>,
    pub partials: Vec<FileInfo>,
}

impl Snapshots {
    /// Lists the module's directory. Read-only, idempotent, safe to repeat;
    /// listing failures are fatal to the request.
    pub async fn list(
        store: &common::Store,
        module_name: &str,
        module_hash: &str,
    ) -> Result<Snapshots, SnapshotError> {
        let objects = store
            .list(module_hash)
            .await
            .map_err(|source| SnapshotError {
                module: module_name.to_string(),
                source,
            })?;

        let mut snapshots = Snapshots::default();
        for object in objects {
            let Some(filename) = object.location.filename() else {
                continue;
            };
            match FileInfo::parse(filename) {
                Some(file) if file.partial => snapshots.partials.push(file),
                Some(file) => snapshots.completes.push(file),
                None => {
                    tracing::warn!(
                        module = module_name,
                        file = filename,
                        "unrecognized file in store directory, skipping"
                    );
                }
            }
        }
        snapshots.completes.sort_by_key(|f| f.range);
        snapshots.partials.sort_by_key(|f| f.range);
        Ok(snapshots)
    }

    /// The highest block any complete snapshot reaches, `None` when there is
    /// no complete snapshot at all.
    pub fn last_completed_block(&self) -> Option<BlockNum> {
        self.completes
            .iter()
            .map(|f| f.range.exclusive_end_block)
            .max()
    }

    /// The complete snapshot with the largest end at or before `block`.
    pub fn last_complete_snapshot_before(&self, block: BlockNum) -> Option<&FileInfo> {
        self.completes
            .iter()
            .filter(|f| f.range.exclusive_end_block <= block)
            .max_by_key(|f| f.range.exclusive_end_block)
    }
}

#[cfg(test)]
mod tests {
    use common::{BlockRange, Ranges, Store};

    use super::{FileInfo, Snapshots};

    fn snapshots(completes: &str, partials: &str) -> Snapshots {
        let completes = Ranges::parse(completes)
            .unwrap()
            .into_iter()
            .map(|r| FileInfo::complete(r.start_block, r.exclusive_end_block))
            .collect();
        let partials = Ranges::parse(partials)
            .unwrap()
            .into_iter()
            .map(FileInfo::partial)
            .collect();
        Snapshots {
            completes,
            partials,
        }
    }

    #[test]
    fn filename_round_trip() {
        let complete = FileInfo::complete(0, 1000);
        assert_eq!(complete.filename, "0-1000.kv");
        assert_eq!(complete.path("abc123"), "abc123/0-1000.kv");
        assert_eq!(FileInfo::parse("0-1000.kv"), Some(complete));

        let partial = FileInfo::partial(BlockRange::new(1000, 2000));
        assert_eq!(partial.filename, "1000-2000.partial");
        assert_eq!(FileInfo::parse("1000-2000.partial"), Some(partial));

        assert_eq!(FileInfo::parse("1000-2000.tmp"), None);
        assert_eq!(FileInfo::parse("garbage"), None);
        assert_eq!(FileInfo::parse("2000-1000.kv"), None);
    }

    #[test]
    fn last_completed_block() {
        // Ranges here share a start; build the file list directly.
        let snapshot = Snapshots {
            completes: vec![FileInfo::complete(100, 200), FileInfo::complete(100, 300)],
            partials: vec![FileInfo::partial(BlockRange::new(300, 400))],
        };
        assert_eq!(snapshot.last_completed_block(), Some(300));

        let snapshot = snapshots("", "200-300");
        assert_eq!(snapshot.last_completed_block(), None);
    }

    #[test]
    fn last_complete_snapshot_before() {
        let snapshot = Snapshots {
            completes: vec![
                FileInfo::complete(10, 20),
                FileInfo::complete(10, 50),
                FileInfo::complete(10, 1000),
            ],
            partials: vec![],
        };

        let cases: &[(u64, Option<(u64, u64)>)] = &[
            (0, None),
            (19, None),
            (20, Some((10, 20))),
            (21, Some((10, 20))),
            (49, Some((10, 20))),
            (50, Some((10, 50))),
            (51, Some((10, 50))),
            (1003, Some((10, 1000))),
        ];
        for (block, expected) in cases {
            let found = snapshot
                .last_complete_snapshot_before(*block)
                .map(|f| (f.range.start_block, f.range.exclusive_end_block));
            assert_eq!(found, *expected, "lookup block {block}");
        }
    }

    #[tokio::test]
    async fn list_classifies_and_skips_unknown() {
        let store = Store::in_memory();
        for path in [
            "abc/0-1000.kv",
            "abc/1000-2000.partial",
            "abc/2000-3000.partial",
            "abc/notes.txt",
            "other/0-500.kv",
        ] {
            store.put_bytes(path, bytes::Bytes::new()).await.unwrap();
        }

        let listed = Snapshots::list(&store, "As", "abc").await.unwrap();
        assert_eq!(listed.completes.len(), 1);
        assert_eq!(listed.partials.len(), 2);
        assert_eq!(listed.partials[0].range, common::BlockRange::new(1000, 2000));
    }
}
