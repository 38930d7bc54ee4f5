use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::context::{FinishedRecord, LogRecord, ProgressRecord, WorkerContext};
use crate::device::DeviceParams;
use crate::executor::SharedState;
use crate::job::BoxedArgs;
use crate::queue::PendingQueue;

/// Flips `alive` to `false` when the worker loop's future is dropped, for
/// any reason: the task panicked and unwound, it was aborted, or it
/// returned normally after a shutdown or a recycle. This is how the
/// executor notices a worker needs replacing at the next `Submit`, since
/// the loop body otherwise only reports itself by ending.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Build a fresh [`WorkerContext`] for `device` and the loop future that
/// drives it, without spawning either.
///
/// The caller (the executor) owns the actual `JoinSet::spawn` call, since
/// it needs to track the task for shutdown. `queue` is passed in rather
/// than created here so it can be preserved across a recycle; `state` lets
/// the loop see cancellation requests made against a job before the
/// worker even picked it up.
#[allow(clippy::too_many_arguments)]
pub(crate) fn new_worker(
    device: DeviceParams,
    queue: Arc<PendingQueue>,
    log_tx: mpsc::Sender<LogRecord>,
    progress_tx: mpsc::Sender<ProgressRecord>,
    finished_tx: mpsc::Sender<FinishedRecord>,
    alive: Arc<AtomicBool>,
    total_jobs: Arc<AtomicU64>,
    state: Arc<Mutex<SharedState>>,
    max_jobs_per_worker: u64,
) -> (Arc<WorkerContext>, impl Future<Output = ()>) {
    let ctx = Arc::new(WorkerContext::new(
        device,
        log_tx,
        progress_tx,
        finished_tx.clone(),
    ));
    alive.store(true, Ordering::SeqCst);
    let loop_ctx = Arc::clone(&ctx);
    let fut = async move {
        let _guard = AliveGuard(alive);
        run_loop(loop_ctx, queue, finished_tx, total_jobs, state, max_jobs_per_worker).await;
    };
    (ctx, fut)
}

/// Drains `queue` until it closes or this worker has run
/// `max_jobs_per_worker` jobs, running each job to completion and
/// reporting it, one job at a time, exactly as spec.md §5 requires
/// ("exactly one job running on a given worker at any instant").
///
/// Exiting once the quota is reached, rather than running forever, is
/// what makes recycling lazy: the executor only notices and respawns a
/// replacement the next time it tries to dispatch to this device.
async fn run_loop(
    ctx: Arc<WorkerContext>,
    queue: Arc<PendingQueue>,
    finished_tx: mpsc::Sender<FinishedRecord>,
    total_jobs: Arc<AtomicU64>,
    state: Arc<Mutex<SharedState>>,
    max_jobs_per_worker: u64,
) {
    loop {
        let entry = match queue.pop().await {
            Some(entry) => entry,
            None => {
                ctx.mark_idle();
                return;
            }
        };

        // `active` isn't populated until this job's first progress emission
        // (spec.md §3), so whether it was cancelled while queued is read
        // straight from the persistent `cancelled` set instead.
        let cancelled_at_start = state.lock().cancelled.contains(&entry.key);
        ctx.clear_flags(entry.key.clone(), cancelled_at_start);
        ctx.log(format!("starting job {}", entry.key));

        let run_ctx = Arc::clone(&ctx);
        let args: BoxedArgs = entry.args;
        let job = entry.job;
        let result = tokio::task::spawn_blocking(move || job.run(&run_ctx, args)).await;

        let jobs_run = total_jobs.fetch_add(1, Ordering::SeqCst) + 1;
        let cancelled = ctx.is_cancelled();
        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(join_err) => Some(format!("job panicked: {join_err}")),
        };

        ctx.log(format!("finished job {}", entry.key));
        let _ = finished_tx
            .send(FinishedRecord {
                job: entry.key,
                device: ctx.device().device.clone(),
                cancelled,
                error,
            })
            .await;

        if jobs_run >= max_jobs_per_worker {
            // Clear the current-job marker before exiting, same as the
            // queue-closed path above: otherwise `ensure_worker`'s
            // orphan-synthesis check (`ctx.current_job()`) could still
            // see this just-finished key and race the finished fan,
            // synthesizing a second, bogus finished record for a job
            // that already completed normally.
            ctx.mark_idle();
            return;
        }
    }
}
