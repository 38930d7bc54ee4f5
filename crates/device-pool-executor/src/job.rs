use std::any::Any;

use crate::context::WorkerContext;

/// Opaque payload handed back to the job body unexamined.
///
/// spec.md §3: "`args` is an opaque payload the Executor does not inspect."
pub type BoxedArgs = Box<dyn Any + Send>;

/// The work a submitted job performs.
///
/// This is the Rust shape of spec.md §9's design note: "a tagged variant or
/// an interface with a single method `Run(ctx, args) -> ()`." Implementors
/// receive a [`WorkerContext`] (to check cancellation and report progress)
/// and the opaque `args` the caller submitted alongside this job.
///
/// `run` is called from inside [`tokio::task::spawn_blocking`] by the
/// worker loop, so it may perform long synchronous work without starving
/// other tasks on the runtime; it must not itself call back into async
/// code that expects to run on a regular worker thread.
pub trait Job: Send + Sync + 'static {
    /// Run the job body. Any `Err` is caught by the worker, logged, and
    /// reported as a non-cancelled failure; it never reaches the caller
    /// directly (spec.md §7: "the core never re-raises job failures into
    /// `Submit` or `Done`").
    fn run(&self, ctx: &WorkerContext, args: BoxedArgs) -> Result<(), anyhow::Error>;
}

/// Adapts a plain closure to [`Job`], for callers who don't want to define
/// a named type for every job kind.
pub struct JobFn<F>(F);

impl<F> JobFn<F>
where
    F: Fn(&WorkerContext, BoxedArgs) -> Result<(), anyhow::Error> + Send + Sync + 'static,
{
    /// Wrap a closure as a [`Job`].
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Job for JobFn<F>
where
    F: Fn(&WorkerContext, BoxedArgs) -> Result<(), anyhow::Error> + Send + Sync + 'static,
{
    fn run(&self, ctx: &WorkerContext, args: BoxedArgs) -> Result<(), anyhow::Error> {
        (self.0)(ctx, args)
    }
}
