use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Shared counters for bytes moved by a run. Cloned handles all point to the
/// same totals.
#[derive(Clone, Debug, Default)]
pub struct BytesMeter {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl BytesMeter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.inner.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.inner.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }
}

impl std::fmt::Display for BytesMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bytes written: {}, bytes read: {}",
            self.bytes_written(),
            self.bytes_read()
        )
    }
}
