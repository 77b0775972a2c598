pub mod kv;
pub mod manifest;
pub mod snapshot;
pub mod state;
pub mod stores;

pub use kv::{FullKv, PartialKv, StoreConfig, UpdatePolicy};
pub use manifest::{Module, ModuleGraph, ModuleKind};
pub use snapshot::{FileInfo, Snapshots};
pub use state::{ModuleStateMap, StoreStorageState};
