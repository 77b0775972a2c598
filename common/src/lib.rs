pub mod config;
pub mod meter;
pub mod range;
pub mod segmenter;
pub mod store;
pub mod tracing;

pub use config::Config;
pub use meter::BytesMeter;
pub use range::{BlockRange, Ranges};
pub use segmenter::Segmenter;
pub use store::Store;

pub type BoxError = Box<dyn std::error::Error + Sync + Send + 'static>;

/// The ordinal of a unit of input. Monotonically increasing, 64 bits.
pub type BlockNum = u64;
