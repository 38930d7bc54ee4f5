use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::DevicePoolConfig;
use crate::context::{FinishedRecord, LogRecord, ProgressRecord, WorkerContext};
use crate::device::DeviceParams;
use crate::error::SubmitError;
use crate::job::{BoxedArgs, Job};
use crate::queue::{PendingEntry, PendingQueue};
use crate::status::{JobState, JobStatus};
use crate::telemetry;
use crate::worker;

/// How often the background reaper (see [`Inner::reap`]) checks for a
/// device whose worker died or was recycled away while jobs were still
/// waiting for it.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// A job that has emitted at least one progress record and hasn't finished
/// yet (spec.md glossary: "Active job"). Created by `run_progress_fan` on
/// first progress, not by `submit` — a merely queued or just-dispatched job
/// with no progress yet is `Unknown` to `done`/`status`, not this.
pub(crate) struct ActiveJob {
    pub(crate) device: String,
    pub(crate) progress: u64,
    pub(crate) cancel_requested: bool,
}

/// State shared between [`DevicePoolExecutor`]'s public methods and the
/// three telemetry fans (`crate::telemetry`).
pub(crate) struct SharedState {
    pub(crate) active: HashMap<String, ActiveJob>,
    finished: VecDeque<JobStatus>,
    finished_limit: usize,
    /// Keys whose cancellation has been requested but not yet observed to
    /// finish (spec.md §3: "set of keys whose cancellation has been
    /// requested but not yet observed to finish"). Populated by `cancel`
    /// even for a key that hasn't been submitted yet, so a later `submit`
    /// of the same key starts out pre-cancelled (spec.md §8: "Cancelling
    /// an unknown key: returns true, adds key to `cancelled_jobs`; if a
    /// matching key is ever submitted later, it will be cancelled on
    /// first progress"). Trimmed by the finished fan once the job lands
    /// in `finished`.
    pub(crate) cancelled: HashSet<String>,
}

impl SharedState {
    fn new(finished_limit: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: VecDeque::new(),
            finished_limit,
            cancelled: HashSet::new(),
        }
    }

    /// Append to the finished history, evicting the oldest entry first
    /// once `finished_limit` is reached (spec.md §4.4: "a bounded ring,
    /// not an unbounded log").
    pub(crate) fn push_finished(&mut self, status: JobStatus) {
        if self.finished.len() >= self.finished_limit {
            self.finished.pop_front();
        }
        self.finished.push_back(status);
    }
}

struct DeviceSlot {
    params: DeviceParams,
    queue: Arc<PendingQueue>,
    alive: Arc<AtomicBool>,
    total_jobs: Arc<AtomicU64>,
    // `None` only during/after `join`: dropping every device's context is
    // what finally releases the last clones of the shared stream senders
    // each `WorkerContext` carries, which is what lets the telemetry
    // fans' channels actually close (see `join` below).
    ctx: Mutex<Option<Arc<WorkerContext>>>,
}

/// The three senders every worker clones from at spawn time. Held behind
/// `Mutex<Option<_>>` so `join` can drop the last master copies and let
/// the telemetry fans notice their channel has closed.
struct Channels {
    log_tx: mpsc::Sender<LogRecord>,
    progress_tx: mpsc::Sender<ProgressRecord>,
    finished_tx: mpsc::Sender<FinishedRecord>,
}

impl Clone for Channels {
    fn clone(&self) -> Self {
        Self {
            log_tx: self.log_tx.clone(),
            progress_tx: self.progress_tx.clone(),
            finished_tx: self.finished_tx.clone(),
        }
    }
}

struct FanHandles {
    log: tokio::task::JoinHandle<()>,
    progress: tokio::task::JoinHandle<()>,
    finished: tokio::task::JoinHandle<()>,
}

struct Inner {
    devices: Vec<DeviceSlot>,
    state: Arc<Mutex<SharedState>>,
    config: DevicePoolConfig,
    workers: Mutex<JoinSet<()>>,
    channels: Mutex<Option<Channels>>,
    fans: Mutex<Option<FanHandles>>,
}

impl Inner {
    fn pick_device_index(&self, pin: Option<&DeviceParams>) -> usize {
        if let Some(pin) = pin {
            if let Some(idx) = self.devices.iter().position(|slot| &slot.params == pin) {
                return idx;
            }
            tracing::warn!(
                device = %pin.device,
                "pin does not match a known device, falling back to least-loaded balancing"
            );
        }
        self.devices
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.queue.len())
            .map(|(idx, _)| idx)
            .expect("executor constructed with at least one device")
    }

    /// Respawn the worker for `idx` if its previous task has died or
    /// exhausted `max_jobs_per_worker`. The device's queue is handed
    /// straight to the new task, so nothing queued while the old worker
    /// was winding down is lost. A no-op if the executor is already
    /// shutting down (its channels have been dropped by `join`).
    fn ensure_worker(&self, idx: usize) {
        let slot = &self.devices[idx];
        if slot.alive.load(Ordering::SeqCst) {
            return;
        }

        // Best-effort: if the dead worker's last context still names a job
        // that's still active (the finished fan hasn't already retired it),
        // that job died along with its worker. Synthesize its completion
        // rather than leaving it stuck in `Pending` forever.
        let orphaned_key = slot
            .ctx
            .lock()
            .as_ref()
            .map(|ctx| ctx.current_job())
            .unwrap_or_default();
        if !orphaned_key.is_empty() {
            let mut state = self.state.lock();
            if let Some(active) = state.active.remove(&orphaned_key) {
                state.cancelled.remove(&orphaned_key);
                state.push_finished(JobStatus {
                    name: orphaned_key,
                    device: active.device,
                    progress: active.progress,
                    cancelled: true,
                    finished: true,
                });
            }
        }

        let channels = match self.channels.lock().as_ref() {
            Some(channels) => channels.clone(),
            None => return,
        };

        slot.total_jobs.store(0, Ordering::SeqCst);
        let (ctx, fut) = worker::new_worker(
            slot.params.clone(),
            Arc::clone(&slot.queue),
            channels.log_tx,
            channels.progress_tx,
            channels.finished_tx,
            Arc::clone(&slot.alive),
            Arc::clone(&slot.total_jobs),
            Arc::clone(&self.state),
            self.config.max_jobs_per_worker,
        );
        *slot.ctx.lock() = Some(ctx);
        self.workers.lock().spawn(fut);
    }

    /// Respawn any device whose worker is gone but whose queue still has
    /// work waiting. Without this, a device that was recycled (or whose
    /// worker died) would sit idle forever unless some *other* `Submit`
    /// happened to target it, since `ensure_worker` above is otherwise
    /// only invoked from `submit`.
    fn reap(&self) {
        for idx in 0..self.devices.len() {
            let slot = &self.devices[idx];
            if !slot.alive.load(Ordering::SeqCst) && slot.queue.len() > 0 {
                self.ensure_worker(idx);
            }
        }
    }
}

/// Dispatches opaque jobs to a fixed pool of device-bound workers.
///
/// One worker runs at a time per device, fed from that device's own
/// bounded pending queue. Progress, completion, and diagnostic log
/// records are fanned in from all workers onto three shared channels and
/// drained by background tasks into state this type exposes through
/// [`status`](Self::status), [`done`](Self::done), and
/// [`cancel`](Self::cancel).
pub struct DevicePoolExecutor {
    inner: Arc<Inner>,
}

impl DevicePoolExecutor {
    /// Build an executor with one worker per device in `devices`.
    ///
    /// Panics if `devices` is empty: an executor with no devices can
    /// never run a job, which is never the caller's intent.
    pub fn new(devices: Vec<DeviceParams>, config: DevicePoolConfig) -> Self {
        assert!(!devices.is_empty(), "device pool must have at least one device");

        let capacity = config.max_pending_per_worker.max(1);
        let (log_tx, log_rx) = mpsc::channel(capacity);
        let (progress_tx, progress_rx) = mpsc::channel(capacity);
        let (finished_tx, finished_rx) = mpsc::channel(capacity);

        let state = Arc::new(Mutex::new(SharedState::new(config.finished_limit)));

        let fans = FanHandles {
            log: tokio::spawn(telemetry::run_log_fan(log_rx, Arc::clone(&config.log_sink))),
            progress: tokio::spawn(telemetry::run_progress_fan(progress_rx, Arc::clone(&state))),
            finished: tokio::spawn(telemetry::run_finished_fan(finished_rx, Arc::clone(&state))),
        };

        let mut workers = JoinSet::new();
        let device_slots: Vec<DeviceSlot> = devices
            .into_iter()
            .map(|params| {
                let queue = Arc::new(PendingQueue::new(config.max_pending_per_worker));
                let alive = Arc::new(AtomicBool::new(false));
                let total_jobs = Arc::new(AtomicU64::new(0));
                let (ctx, fut) = worker::new_worker(
                    params.clone(),
                    Arc::clone(&queue),
                    log_tx.clone(),
                    progress_tx.clone(),
                    finished_tx.clone(),
                    Arc::clone(&alive),
                    Arc::clone(&total_jobs),
                    Arc::clone(&state),
                    config.max_jobs_per_worker,
                );
                workers.spawn(fut);
                DeviceSlot {
                    params,
                    queue,
                    alive,
                    total_jobs,
                    ctx: Mutex::new(Some(ctx)),
                }
            })
            .collect();

        let inner = Arc::new(Inner {
            devices: device_slots,
            state,
            config,
            workers: Mutex::new(workers),
            channels: Mutex::new(Some(Channels {
                log_tx,
                progress_tx,
                finished_tx,
            })),
            fans: Mutex::new(Some(fans)),
        });

        let reaper = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAP_INTERVAL).await;
                match reaper.upgrade() {
                    Some(inner) => inner.reap(),
                    None => return,
                }
            }
        });

        Self { inner }
    }

    /// Enqueue a job. `pin`, if given and matching a known device, sends
    /// the job there regardless of load; otherwise (including an unknown
    /// pin) the least-loaded device is chosen, ties broken by device
    /// order (spec.md §9: a genuine least-queue-depth selection, not the
    /// original's index-sum arithmetic).
    pub fn submit(
        &self,
        key: impl Into<String>,
        job: Arc<dyn Job>,
        args: BoxedArgs,
        pin: Option<&DeviceParams>,
    ) -> Result<(), SubmitError> {
        let key = key.into();
        let idx = self.inner.pick_device_index(pin);
        self.inner.ensure_worker(idx);
        let slot = &self.inner.devices[idx];

        // No `active` entry is created here: spec.md §3 ("Entry is created
        // on first progress update") and the glossary's "Active job" both
        // make first progress emission, not submission, the point a job
        // becomes externally discoverable. The `run_progress_fan` upsert
        // is what creates it.
        let entry = PendingEntry { key, job, args };
        if slot.queue.try_push(entry) {
            Ok(())
        } else {
            Err(SubmitError::Backpressure {
                device: slot.params.device.clone(),
            })
        }
    }

    /// Request cancellation of `key`. Always returns `true` — the return
    /// value is vestigial per spec.md §6 — and is idempotent: recording
    /// the request for a key that isn't active yet (never submitted, or
    /// queued but not yet dispatched) is exactly as valid as cancelling a
    /// running job, per spec.md §8's "Cancelling an unknown key: returns
    /// true, adds key to `cancelled_jobs`; if a matching key is ever
    /// submitted later, it will be cancelled on first progress."
    pub fn cancel(&self, key: &str) -> bool {
        let device = {
            let mut state = self.inner.state.lock();
            state.cancelled.insert(key.to_string());
            match state.active.get_mut(key) {
                Some(active) => {
                    active.cancel_requested = true;
                    Some(active.device.clone())
                }
                None => None,
            }
        };
        match device {
            // Job has already emitted progress: go straight to its device.
            Some(device) => {
                if let Some(slot) = self.inner.devices.iter().find(|slot| slot.params.device == device) {
                    if let Some(ctx) = slot.ctx.lock().as_ref() {
                        ctx.cancel_if_current(key);
                    }
                }
            }
            // Not in `active` yet — either never submitted (nothing more to
            // do; `cancelled` will seed `clear_flags` at dispatch), or
            // already dispatched but hasn't emitted its first progress
            // record yet. Scan every device's context for that race: a
            // worker may be running this job right now without the
            // progress fan having upserted it into `active` yet.
            None => {
                for slot in &self.inner.devices {
                    if let Some(ctx) = slot.ctx.lock().as_ref() {
                        if ctx.cancel_if_current(key) {
                            break;
                        }
                    }
                }
            }
        }
        true
    }

    /// Look up a job's state and last-known progress. `Unknown` covers a
    /// key that was never submitted, one still queued or running but yet
    /// to emit its first progress record, and one that has aged out of the
    /// bounded finished history.
    pub fn done(&self, key: &str) -> (JobState, u64) {
        let state = self.inner.state.lock();
        if let Some(active) = state.active.get(key) {
            return (JobState::Pending, active.progress);
        }
        if let Some(status) = state.finished.iter().rev().find(|status| status.name == key) {
            return (JobState::Finished, status.progress);
        }
        (JobState::Unknown, 0)
    }

    /// Snapshot every job the executor currently knows about: active jobs
    /// first, then the bounded finished history, oldest first.
    pub fn status(&self) -> Vec<JobStatus> {
        let state = self.inner.state.lock();
        let mut statuses: Vec<JobStatus> = state
            .active
            .iter()
            .map(|(name, active)| JobStatus {
                name: name.clone(),
                device: active.device.clone(),
                progress: active.progress,
                cancelled: active.cancel_requested,
                finished: false,
            })
            .collect();
        statuses.extend(state.finished.iter().cloned());
        statuses
    }

    /// Close every device's pending queue and wait (up to `join_timeout`)
    /// for all worker tasks and telemetry fans to drain, consuming the
    /// executor. Jobs already queued when `join` is called still run;
    /// nothing new can be submitted afterward since `self` is gone.
    pub async fn join(self) {
        for slot in &self.inner.devices {
            slot.queue.close();
        }
        self.inner.channels.lock().take();

        let join_timeout = self.inner.config.join_timeout;
        let mut workers = std::mem::take(&mut *self.inner.workers.lock());
        loop {
            match tokio::time::timeout(join_timeout, workers.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    break;
                }
            }
        }

        // Every worker task has now exited, so no `WorkerContext` is in
        // use. Drop them: each one carries its own clone of the log/
        // progress/finished senders, and `self` (holding `Arc<Inner>`,
        // holding these slots) stays alive for the rest of this function
        // — without this, the fan wait below would never see its channel
        // close and would always run out the full `join_timeout`.
        for slot in &self.inner.devices {
            slot.ctx.lock().take();
        }

        if let Some(fans) = self.inner.fans.lock().take() {
            let _ = tokio::time::timeout(join_timeout, async {
                let _ = tokio::join!(fans.log, fans.progress, fans.finished);
            })
            .await;
        }
    }
}
