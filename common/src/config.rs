use std::{path::PathBuf, sync::Arc, time::Duration};

use figment::{
    providers::{Env, Format as _, Toml},
    Figment,
};
use fs_err as fs;
use serde::Deserialize;

use crate::{BoxError, Store};

/// Resolved runtime configuration for a backfill run.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_store: Arc<Store>,

    /// Blocks per segment; sets the snapshot cadence.
    pub save_interval: u64,
    /// Blocks per job; a multiple of `save_interval`.
    pub subrequest_split: u64,
    /// Number of concurrent workers.
    pub parallelism: usize,

    /// Attempts per job before the request fails.
    pub retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,

    /// Per-module progress emission cadence.
    pub progress_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub data_dir: String,

    #[serde(default = "defaults::save_interval")]
    pub save_interval: u64,
    #[serde(default = "defaults::subrequest_split")]
    pub subrequest_split: u64,
    #[serde(default = "defaults::parallelism")]
    pub parallelism: usize,

    #[serde(default = "defaults::retries")]
    pub retries: u32,
    #[serde(default = "defaults::min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "defaults::max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "defaults::progress_interval_ms")]
    pub progress_interval_ms: u64,
}

mod defaults {
    pub fn save_interval() -> u64 {
        1000
    }
    pub fn subrequest_split() -> u64 {
        10_000
    }
    pub fn parallelism() -> usize {
        4
    }
    pub fn retries() -> u32 {
        3
    }
    pub fn min_backoff_ms() -> u64 {
        100
    }
    pub fn max_backoff_ms() -> u64 {
        5000
    }
    pub fn progress_interval_ms() -> u64 {
        500
    }
}

impl Config {
    /// Loads configuration from a TOML file. Env vars prefixed with
    /// `SLUICE_CONFIG_` override file values.
    pub fn load(file: impl Into<PathBuf>) -> Result<Self, BoxError> {
        let config_path: PathBuf = fs::canonicalize(file.into())?;
        let contents = fs::read_to_string(&config_path)?;

        let config_file: ConfigFile = Figment::new()
            .merge(Toml::string(&contents))
            .merge(Env::prefixed("SLUICE_CONFIG_"))
            .extract()?;

        // Resolve a filesystem data dir relative to the config file location.
        let base = config_path.parent();
        let data_store = Store::new(config_file.data_dir.clone(), base)?;

        Self::from_parts(config_file, Arc::new(data_store))
    }

    /// For testing purposes only.
    pub fn in_memory() -> Self {
        Config {
            data_store: Arc::new(Store::in_memory()),
            save_interval: defaults::save_interval(),
            subrequest_split: defaults::subrequest_split(),
            parallelism: defaults::parallelism(),
            retries: defaults::retries(),
            min_backoff: Duration::from_millis(defaults::min_backoff_ms()),
            max_backoff: Duration::from_millis(defaults::max_backoff_ms()),
            progress_interval: Duration::from_millis(defaults::progress_interval_ms()),
        }
    }

    fn from_parts(file: ConfigFile, data_store: Arc<Store>) -> Result<Self, BoxError> {
        if file.save_interval == 0 {
            return Err("save_interval must be non-zero".into());
        }
        if file.subrequest_split == 0 || file.subrequest_split % file.save_interval != 0 {
            return Err(format!(
                "subrequest_split ({}) must be a non-zero multiple of save_interval ({})",
                file.subrequest_split, file.save_interval
            )
            .into());
        }
        if file.parallelism == 0 {
            return Err("parallelism must be at least 1".into());
        }

        Ok(Config {
            data_store,
            save_interval: file.save_interval,
            subrequest_split: file.subrequest_split,
            parallelism: file.parallelism,
            retries: file.retries,
            min_backoff: Duration::from_millis(file.min_backoff_ms),
            max_backoff: Duration::from_millis(file.max_backoff_ms),
            progress_interval: Duration::from_millis(file.progress_interval_ms),
        })
    }
}
