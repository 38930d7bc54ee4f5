use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::device::DeviceParams;
use crate::error::ProgressError;

/// One drained log entry, fanned into the configured [`LogSink`](crate::LogSink).
pub(crate) struct LogRecord {
    pub(crate) job: String,
    pub(crate) device: String,
    pub(crate) message: String,
}

/// One progress step, fanned into the executor's last-known-progress table.
pub(crate) struct ProgressRecord {
    pub(crate) job: String,
    pub(crate) device: String,
    pub(crate) step: u64,
}

/// One completion, fanned into the executor's bounded finished history.
pub(crate) struct FinishedRecord {
    pub(crate) job: String,
    pub(crate) device: String,
    pub(crate) cancelled: bool,
    pub(crate) error: Option<String>,
}

/// Per-worker handle passed to every job body it runs.
///
/// One `WorkerContext` is created per worker task and reused across every
/// job that task subsequently executes; [`clear_flags`](Self::clear_flags)
/// resets its per-job state (current key, cancel flag, progress counter)
/// immediately before each job starts, mirroring the original worker's
/// single long-lived context object rather than a fresh one per job.
pub struct WorkerContext {
    job: Mutex<String>,
    device: DeviceParams,
    cancel: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    log_tx: mpsc::Sender<LogRecord>,
    progress_tx: mpsc::Sender<ProgressRecord>,
    finished_tx: mpsc::Sender<FinishedRecord>,
}

impl WorkerContext {
    pub(crate) fn new(
        device: DeviceParams,
        log_tx: mpsc::Sender<LogRecord>,
        progress_tx: mpsc::Sender<ProgressRecord>,
        finished_tx: mpsc::Sender<FinishedRecord>,
    ) -> Self {
        Self {
            job: Mutex::new(String::new()),
            device,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(AtomicU64::new(0)),
            log_tx,
            progress_tx,
            finished_tx,
        }
    }

    /// Whether the current job's cancel flag has been set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// The device this context, and therefore its worker, is bound to.
    pub fn device(&self) -> &DeviceParams {
        &self.device
    }

    /// Last progress step reported for the currently running job.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Capture a callback bound to the job currently running on this
    /// context, for a job body to invoke repeatedly as it makes progress.
    pub fn progress_callback(&self) -> ProgressHandle {
        ProgressHandle {
            job: self.job.lock().clone(),
            device: self.device.device.clone(),
            cancel: Arc::clone(&self.cancel),
            progress: Arc::clone(&self.progress),
            progress_tx: self.progress_tx.clone(),
        }
    }

    /// Report unconditional completion of the current job. The worker
    /// loop already sends a finished record when `run` returns; this
    /// exists for job bodies that need to signal completion explicitly
    /// rather than relying on `run`'s return.
    pub async fn set_finished(&self) {
        let job = self.job.lock().clone();
        let _ = self
            .finished_tx
            .send(FinishedRecord {
                job,
                device: self.device.device.clone(),
                cancelled: self.is_cancelled(),
                error: None,
            })
            .await;
    }

    /// Append a record to the log stream, tagged with the current job key
    /// and this context's device.
    pub fn log(&self, message: impl Into<String>) {
        let record = LogRecord {
            job: self.job.lock().clone(),
            device: self.device.device.clone(),
            message: message.into(),
        };
        let _ = self.log_tx.try_send(record);
    }

    /// Reset per-job state immediately before a new job starts running on
    /// this context. `cancelled_at_start` seeds the cancel flag for a job
    /// that was cancelled while still queued, so it never gets to run at
    /// all. Called by the worker loop, never by a job body.
    pub(crate) fn clear_flags(&self, job: String, cancelled_at_start: bool) {
        *self.job.lock() = job;
        self.cancel.store(cancelled_at_start, Ordering::SeqCst);
        self.progress.store(0, Ordering::SeqCst);
    }

    /// Shared handle to this context's cancel flag, so the telemetry fan
    /// can flip it on an incoming `Cancel` call without holding the
    /// context itself.
    pub(crate) fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Key of the job currently running on this context, or an empty
    /// string if none is (no job has started yet, or the worker exited
    /// cleanly after its last one).
    pub(crate) fn current_job(&self) -> String {
        self.job.lock().clone()
    }

    /// Clear the current job key without touching cancel/progress state.
    /// Called by the worker loop right before it returns after a clean
    /// exit (shutdown or quota reached), so the executor can tell a clean
    /// exit apart from one where the job in flight never got to report
    /// its own completion.
    pub(crate) fn mark_idle(&self) {
        self.job.lock().clear();
    }

    /// Set the cancel flag only if `key` is still the job running on this
    /// context. Returns whether it matched. A worker may have already
    /// moved on to a different job by the time `Cancel` is processed, in
    /// which case this is a harmless no-op (spec.md §4.4: cancelling a
    /// job that has already finished has no effect).
    pub(crate) fn cancel_if_current(&self, key: &str) -> bool {
        let job = self.job.lock();
        if *job == key {
            self.cancel.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// A callable bound to one job's key and cancel flag, captured at the
/// moment [`WorkerContext::progress_callback`] was called.
///
/// This is the Rust shape of spec.md §4.1's "callable bound to the current
/// job key": a job body can hold one of these across its own inner loop
/// without needing a reference back to the whole `WorkerContext`.
#[derive(Clone)]
pub struct ProgressHandle {
    job: String,
    device: String,
    cancel: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    progress_tx: mpsc::Sender<ProgressRecord>,
}

impl ProgressHandle {
    /// Report a new progress step.
    ///
    /// Returns `Err(ProgressError::Cancelled)` if this job's cancel flag is
    /// set, so a job body's own loop can bail out promptly instead of
    /// discovering cancellation only after finishing. Returns
    /// `Err(ProgressError::Backpressure)` if the shared progress stream is
    /// full; the step is dropped but the job continues.
    pub fn emit(&self, step: u64) -> Result<(), ProgressError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(ProgressError::Cancelled {
                job: self.job.clone(),
            });
        }
        self.progress.store(step, Ordering::SeqCst);
        self.progress_tx
            .try_send(ProgressRecord {
                job: self.job.clone(),
                device: self.device.clone(),
                step,
            })
            .map_err(|_| ProgressError::Backpressure {
                job: self.job.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (
        WorkerContext,
        mpsc::Receiver<LogRecord>,
        mpsc::Receiver<ProgressRecord>,
        mpsc::Receiver<FinishedRecord>,
    ) {
        let (log_tx, log_rx) = mpsc::channel(8);
        let (progress_tx, progress_rx) = mpsc::channel(8);
        let (finished_tx, finished_rx) = mpsc::channel(8);
        let ctx = WorkerContext::new(DeviceParams::new("cpu"), log_tx, progress_tx, finished_tx);
        (ctx, log_rx, progress_rx, finished_rx)
    }

    #[test]
    fn clear_flags_resets_progress_and_cancel() {
        let (ctx, _log_rx, _progress_rx, _finished_rx) = context();
        ctx.clear_flags("job-1".to_string(), false);
        ctx.cancel_handle().store(true, Ordering::SeqCst);
        ctx.progress_callback().emit(5).unwrap_err();
        assert!(ctx.is_cancelled());

        ctx.clear_flags("job-2".to_string(), false);
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.progress(), 0);
    }

    #[test]
    fn clear_flags_can_seed_cancelled() {
        let (ctx, _log_rx, _progress_rx, _finished_rx) = context();
        ctx.clear_flags("job-1".to_string(), true);
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn progress_callback_emits_to_stream() {
        let (ctx, _log_rx, mut progress_rx, _finished_rx) = context();
        ctx.clear_flags("job-1".to_string(), false);
        let handle = ctx.progress_callback();
        handle.emit(3).unwrap();
        assert_eq!(ctx.progress(), 3);
        let record = progress_rx.recv().await.unwrap();
        assert_eq!(record.job, "job-1");
        assert_eq!(record.step, 3);
    }

    #[test]
    fn emit_after_cancel_errors() {
        let (ctx, _log_rx, _progress_rx, _finished_rx) = context();
        ctx.clear_flags("job-1".to_string(), false);
        let handle = ctx.progress_callback();
        ctx.cancel_handle().store(true, Ordering::SeqCst);
        let err = handle.emit(1).unwrap_err();
        assert!(matches!(err, ProgressError::Cancelled { job } if job == "job-1"));
    }

    #[test]
    fn cancel_if_current_ignores_stale_key() {
        let (ctx, _log_rx, _progress_rx, _finished_rx) = context();
        ctx.clear_flags("job-1".to_string(), false);
        assert!(!ctx.cancel_if_current("job-0"));
        assert!(!ctx.is_cancelled());
        assert!(ctx.cancel_if_current("job-1"));
        assert!(ctx.is_cancelled());
    }
}
