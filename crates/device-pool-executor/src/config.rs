use std::sync::Arc;
use std::time::Duration;

use crate::log_sink::LogSink;

/// Construction parameters for a [`DevicePoolExecutor`](crate::DevicePoolExecutor).
///
/// Defaults match spec.md §6's constructor:
/// `NewExecutor(devices, max_jobs_per_worker=10, max_pending_per_worker=100,
/// finished_limit=10, join_timeout=1.0s)`.
pub struct DevicePoolConfig {
    /// Lifetime job count after which a worker is recycled at the next
    /// `Submit` for its device.
    pub max_jobs_per_worker: u64,
    /// Capacity of each device's pending queue, and of the shared
    /// progress/finished/log streams.
    pub max_pending_per_worker: usize,
    /// Number of completed jobs retained for `Done`/`Status` lookups.
    pub finished_limit: usize,
    /// Bound on graceful shutdown in [`DevicePoolExecutor::join`](crate::DevicePoolExecutor::join):
    /// how long to wait for worker tasks and telemetry fans to drain
    /// before the wait is abandoned.
    pub join_timeout: Duration,
    /// Sink the log fan appends drained log records to.
    pub log_sink: Arc<dyn LogSink>,
}

impl DevicePoolConfig {
    /// Default `max_jobs_per_worker`.
    pub const DEFAULT_MAX_JOBS_PER_WORKER: u64 = 10;
    /// Default `max_pending_per_worker`.
    pub const DEFAULT_MAX_PENDING_PER_WORKER: usize = 100;
    /// Default `finished_limit`.
    pub const DEFAULT_FINISHED_LIMIT: usize = 10;
    /// Default `join_timeout`.
    pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Build a config with spec.md's defaults and the given log sink.
    pub fn new(log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            max_jobs_per_worker: Self::DEFAULT_MAX_JOBS_PER_WORKER,
            max_pending_per_worker: Self::DEFAULT_MAX_PENDING_PER_WORKER,
            finished_limit: Self::DEFAULT_FINISHED_LIMIT,
            join_timeout: Self::DEFAULT_JOIN_TIMEOUT,
            log_sink,
        }
    }
}

impl std::fmt::Debug for DevicePoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePoolConfig")
            .field("max_jobs_per_worker", &self.max_jobs_per_worker)
            .field("max_pending_per_worker", &self.max_pending_per_worker)
            .field("finished_limit", &self.finished_limit)
            .field("join_timeout", &self.join_timeout)
            .finish_non_exhaustive()
    }
}
