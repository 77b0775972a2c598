use std::{fmt, time::Instant};

use common::BlockRange;

/// The unit of dispatch: one request to compute one store module's partial
/// fragment over one segment-aligned range.
#[derive(Clone, Debug)]
pub struct Job {
    pub module_name: String,
    pub request_range: BlockRange,

    /// Higher runs earlier; modules closer to the leaves of the dependency
    /// graph get higher priorities so their snapshots unblock descendants
    /// sooner.
    pub priority: i32,

    /// Store modules whose snapshots must reach `request_range.start_block`
    /// before this job may run.
    pub required_modules: Vec<String>,

    pub created_at: Instant,
    pub scheduled_at: Option<Instant>,
    pub attempts: u32,
}

impl Job {
    pub fn new(
        module_name: String,
        request_range: BlockRange,
        required_modules: Vec<String>,
        priority: i32,
    ) -> Job {
        Job {
            module_name,
            request_range,
            priority,
            required_modules,
            created_at: Instant::now(),
            scheduled_at: None,
            attempts: 0,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job: module={} range={} priority={}",
            self.module_name, self.request_range, self.priority
        )
    }
}
