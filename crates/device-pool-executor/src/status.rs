use serde::{Deserialize, Serialize};

/// Where a job stands from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Job has completed (successfully, with a failure, or cancelled).
    Finished,
    /// Job is active or still queued.
    Pending,
    /// No record of this key — never submitted, or aged out of the
    /// bounded finished history.
    Unknown,
}

/// Immutable snapshot of a job's progress as of the moment it was read.
///
/// Once `finished` is `true` the entry this was copied from never changes
/// again — see spec.md §3, "Monotonic: once `finished=true`, the entry is
/// immutable."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Caller-supplied job key.
    pub name: String,
    /// Name of the device the job ran (or is running) on.
    pub device: String,
    /// Last progress value observed.
    pub progress: u64,
    /// Whether cancellation was requested for this job.
    pub cancelled: bool,
    /// Whether the job has finished.
    pub finished: bool,
}
