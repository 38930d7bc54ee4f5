/// Errors raised by [`DevicePoolExecutor::submit`](crate::DevicePoolExecutor::submit).
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The selected device's pending queue was at `max_pending_per_worker`
    /// capacity. The job was never enqueued; the device's lifetime job
    /// counter is not rolled back (spec.md §4.4: "the job simply never
    /// existed").
    #[error("pending queue for device {device:?} is full")]
    Backpressure {
        /// Device whose queue rejected the job.
        device: String,
    },
}

/// Errors raised by calls through [`ProgressHandle`](crate::ProgressHandle).
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// The job's cancel flag was observed set at emission time. The worker
    /// treats this as a normal (cancelled) completion, not a crash.
    #[error("job {job:?} was cancelled")]
    Cancelled {
        /// Job key that was cancelled.
        job: String,
    },
    /// The shared progress stream was full. This is swallowed by the
    /// worker; it does not fail the job.
    #[error("progress stream is full, update for job {job:?} dropped")]
    Backpressure {
        /// Job key whose update was dropped.
        job: String,
    },
}
