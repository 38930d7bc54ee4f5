#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! A scheduler that dispatches opaque jobs to a fixed pool of device-bound
//! workers, fans in progress/completion telemetry, supports cooperative
//! cancellation, and recycles workers to bound resource use.
//!
//! The crate is deliberately narrow: it knows nothing about what a job
//! *does* (tensor compute, file I/O, model loading are all external to
//! it), only how to run one job at a time per device, report on it, and
//! tear a worker down and rebuild it once it has done too much work or
//! died.

mod config;
mod context;
mod device;
mod error;
mod executor;
mod job;
mod log_sink;
mod queue;
mod status;
mod telemetry;
mod worker;

pub use config::DevicePoolConfig;
pub use context::{ProgressHandle, WorkerContext};
pub use device::DeviceParams;
pub use error::{ProgressError, SubmitError};
pub use executor::DevicePoolExecutor;
pub use job::{BoxedArgs, Job, JobFn};
pub use log_sink::{FileLogSink, LogSink};
pub use status::{JobState, JobStatus};
