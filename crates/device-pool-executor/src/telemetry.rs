use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::context::{FinishedRecord, LogRecord, ProgressRecord};
use crate::executor::{ActiveJob, SharedState};
use crate::log_sink::LogSink;
use crate::status::JobStatus;

/// The three background fans described by spec.md §4.3, each draining one
/// bounded channel into executor-owned state. Unlike the original's
/// threads, which poll their queue with a timeout so they can notice a
/// shutdown flag, these are plain `recv().await` loops: a tokio mpsc
/// receiver returns `None` on its own once every clone of its sender has
/// been dropped, which is exactly when the executor and all its workers
/// have gone away, so no separate shutdown signal is needed.
/// Drains log records and appends each to the configured sink.
pub(crate) async fn run_log_fan(mut rx: mpsc::Receiver<LogRecord>, sink: Arc<dyn LogSink>) {
    while let Some(record) = rx.recv().await {
        let line = format!("[{}] {}: {}", record.device, record.job, record.message);
        if let Err(error) = sink.write(&line) {
            tracing::warn!(job = %record.job, device = %record.device, %error, "log sink write failed");
        }
    }
}

/// Drains progress records into the active-job progress table.
///
/// This is the only place an `active_jobs` entry is created (spec.md §3:
/// "Entry is created on first progress update"; §4.3: the progress fan
/// "upsert[s] `active_jobs`"). A job is not externally discoverable until
/// this runs for its first emission.
pub(crate) async fn run_progress_fan(
    mut rx: mpsc::Receiver<ProgressRecord>,
    state: Arc<Mutex<SharedState>>,
) {
    while let Some(record) = rx.recv().await {
        let mut state = state.lock();
        if let Some(active) = state.active.get_mut(&record.job) {
            active.progress = record.step;
        } else {
            let cancel_requested = state.cancelled.contains(&record.job);
            state.active.insert(
                record.job.clone(),
                ActiveJob {
                    device: record.device.clone(),
                    progress: record.step,
                    cancel_requested,
                },
            );
        }
    }
}

/// Drains finished records, moving each job out of the active table and
/// into the bounded finished history.
pub(crate) async fn run_finished_fan(
    mut rx: mpsc::Receiver<FinishedRecord>,
    state: Arc<Mutex<SharedState>>,
) {
    while let Some(record) = rx.recv().await {
        if let Some(error) = &record.error {
            tracing::debug!(job = %record.job, %error, "job finished with error");
        }
        let mut state = state.lock();
        let progress = state
            .active
            .remove(&record.job)
            .map(|active| active.progress)
            .unwrap_or(0);
        state.cancelled.remove(&record.job);
        state.push_finished(JobStatus {
            name: record.job,
            device: record.device,
            progress,
            cancelled: record.cancelled,
            finished: true,
        });
    }
}
