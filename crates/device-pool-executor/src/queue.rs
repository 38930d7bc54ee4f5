use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::job::{BoxedArgs, Job};

/// One entry waiting to run: the caller's key, the job body, and its
/// opaque args.
pub(crate) struct PendingEntry {
    pub(crate) key: String,
    pub(crate) job: Arc<dyn Job>,
    pub(crate) args: BoxedArgs,
}

/// A device's bounded FIFO of not-yet-started jobs.
///
/// Modeled as Executor-owned shared state (a mutex-guarded deque plus a
/// notify) rather than a channel, so that recycling the worker task that
/// reads from it never loses queued work: a fresh worker task is simply
/// handed a clone of the same `Arc<PendingQueue>`. See SPEC_FULL.md §3,
/// "`PendingQueue` — the one addition to spec.md's data model."
pub(crate) struct PendingQueue {
    capacity: usize,
    items: Mutex<VecDeque<PendingEntry>>,
    notify: Notify,
    closed: AtomicBool,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Signal shutdown: wake every worker blocked in [`pop`](Self::pop) so
    /// it can exit once the queue drains, instead of waiting forever for
    /// an entry that will never arrive. Already-queued entries are still
    /// returned by `pop` before it starts yielding `None`.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Non-blocking enqueue. Returns `false` (without enqueuing) if the
    /// queue is already at capacity.
    pub(crate) fn try_push(&self, entry: PendingEntry) -> bool {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return false;
            }
            items.push_back(entry);
        }
        self.notify.notify_one();
        true
    }

    /// Current queue depth, used for least-loaded balancing.
    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Block (asynchronously) until an entry is available, then pop it.
    /// The only intended idle point for a worker task (spec.md §5). Returns
    /// `None` once the queue has been closed and drained, telling the
    /// worker loop to exit.
    pub(crate) async fn pop(&self) -> Option<PendingEntry> {
        loop {
            // Register interest before re-checking state, not after: a
            // `close()` (or `try_push`) landing between the check below
            // and an `notified()` call made afterward would otherwise
            // fire `notify_waiters`/`notify_one` into a Notify nobody was
            // yet subscribed to, and this loop would wait forever for a
            // wakeup that already happened.
            let notified = self.notify.notified();
            if let Some(entry) = self.items.lock().pop_front() {
                return Some(entry);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobFn;

    fn dummy_entry(key: &str) -> PendingEntry {
        PendingEntry {
            key: key.to_string(),
            job: Arc::new(JobFn::new(|_ctx, _args| Ok(()))),
            args: Box::new(()),
        }
    }

    #[test]
    fn rejects_beyond_capacity() {
        let queue = PendingQueue::new(1);
        assert!(queue.try_push(dummy_entry("a")));
        assert!(!queue.try_push(dummy_entry("b")));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn pop_is_fifo() {
        let queue = PendingQueue::new(4);
        queue.try_push(dummy_entry("a"));
        queue.try_push(dummy_entry("b"));
        assert_eq!(queue.pop().await.unwrap().key, "a");
        assert_eq!(queue.pop().await.unwrap().key, "b");
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_once_drained() {
        let queue = PendingQueue::new(4);
        queue.try_push(dummy_entry("a"));
        queue.close();
        assert_eq!(queue.pop().await.unwrap().key, "a");
        assert!(queue.pop().await.is_none());
    }
}
