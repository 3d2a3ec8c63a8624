//! The engine: two work-stealing pools, the frame table and their shared lifecycle.

use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::metrics::FAST_PATH_AWAITS;
use crate::pool::{WorkTracker, resolve_worker_count};
use crate::{
    CoroutineResumption, FrameAllocator, FrameHandle, FrameInfo, FrameTable, Future,
    HeapFrameAllocator, Pool, RampResult, Rejected, ResumeContext, RuntimeError, SpawnInvocation,
    StackFrame, TaskError,
};

const DEFAULT_THREAD_NAME_PREFIX: &str = "steal";

/// The running pools. Created together and torn down together.
struct Pools {
    tracker: Arc<WorkTracker>,
    spawn: Pool<SpawnInvocation>,
    coroutine: Pool<CoroutineResumption>,
}

impl Pools {
    fn start(
        worker_count: usize,
        thread_name_prefix: &str,
        engine: Weak<EngineShared>,
    ) -> Result<Self, RuntimeError> {
        let worker_count = resolve_worker_count(worker_count).get();

        // Both pools drain as one: a spawned task may complete a frame and a resumed frame may
        // spawn more work.
        let tracker = Arc::new(WorkTracker::new());

        let spawn = Pool::<SpawnInvocation>::builder()
            .worker_count(worker_count)
            .thread_name(format!("{thread_name_prefix}-spawn"))
            .tracker(Arc::clone(&tracker))
            .build(())?;

        let coroutine = Pool::<CoroutineResumption>::builder()
            .worker_count(worker_count)
            .thread_name(format!("{thread_name_prefix}-coro"))
            .tracker(Arc::clone(&tracker))
            .build(ResumeContext::new(engine))?;

        debug!(worker_count, "engine pools started");

        Ok(Self {
            tracker,
            spawn,
            coroutine,
        })
    }

    fn shutdown(&self) {
        // The first pool to shut down waits for the shared drain, the second finds it complete.
        self.spawn.shutdown();
        self.coroutine.shutdown();
    }
}

pub(crate) struct EngineShared {
    // Handed to resumed frames so they can reach the scheduler without keeping the engine alive.
    self_ref: Weak<EngineShared>,

    worker_count: usize,
    thread_name_prefix: String,

    frames: Arc<FrameTable>,

    // Serializes start and shutdown. Never taken on the scheduling path.
    lifecycle: Mutex<()>,
    pools: OnceLock<Pools>,
    shut_down: AtomicBool,
}

impl EngineShared {
    fn start(&self, worker_count: usize) -> Result<&Pools, RuntimeError> {
        let _lifecycle = self.lifecycle.lock();

        if self.shut_down.load(Ordering::Acquire) {
            return Err(RuntimeError::ShutDown);
        }

        if let Some(pools) = self.pools.get() {
            return Ok(pools);
        }

        let pools = Pools::start(
            worker_count,
            &self.thread_name_prefix,
            Weak::clone(&self.self_ref),
        )?;
        Ok(self.pools.get_or_init(|| pools))
    }

    /// The pools, started on first use with the configured worker count.
    fn pools(&self) -> Result<&Pools, RuntimeError> {
        match self.pools.get() {
            Some(pools) => Ok(pools),
            None => self.start(self.worker_count),
        }
    }

    /// The pools, if the caller may still submit work.
    ///
    /// Once shutdown has begun, only work produced by the engine's own workers is accepted.
    fn admit(&self) -> Result<&Pools, RuntimeError> {
        let pools = self.pools()?;

        if pools.tracker.is_accepting() || pools.tracker.is_current_thread_internal() {
            Ok(pools)
        } else {
            Err(RuntimeError::ShutDown)
        }
    }

    /// The pools, if the caller may resolve a frame that already exists.
    ///
    /// Unlike new work, this stays possible while shutdown is draining: the work being drained
    /// may be blocked on exactly this frame.
    fn admit_continuation(&self) -> Result<&Pools, RuntimeError> {
        let pools = self.pools()?;
        let tracker = &pools.tracker;

        if tracker.is_accepting() || tracker.is_current_thread_internal() || tracker.in_flight() > 0
        {
            Ok(pools)
        } else {
            Err(RuntimeError::ShutDown)
        }
    }

    fn schedule_resumptions(pools: &Pools, runnable: Vec<CoroutineResumption>) {
        for resumption in runnable {
            if let Err(rejected) = pools.coroutine.schedule_continuation(resumption) {
                // Dropping the rejected resumption fails its frame.
                warn!(reason = %rejected.reason(), "cannot schedule resumption");
            }
        }
    }

    #[cfg_attr(test, mutants::skip)] // Skipping shutdown makes every test hang on drop.
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Waits for a start in progress, so that the pools it creates are shut down too.
        let _lifecycle = self.lifecycle.lock();

        if let Some(pools) = self.pools.get() {
            pools.shutdown();
        }

        // Whatever still waits can never be resumed now.
        self.frames.abandon_all();

        debug!("engine shut down");
    }
}

impl fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("worker_count", &self.worker_count)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("frames", &self.frames)
            .field("started", &self.pools.get().is_some())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

/// Executes spawned tasks and resumes suspended coroutine frames on two pools of worker threads.
///
/// The engine owns its workers: dropping it (or calling [`shutdown()`][Self::shutdown]) waits
/// for all accepted work to finish, including work that running tasks schedule, and then stops
/// the workers. Frames still suspended at that point are failed with [`TaskError::Abandoned`].
///
/// Work is submitted through a [`Scheduler`], a cheap handle that can be cloned and sent to
/// other threads. The worker threads start on first use or on an explicit
/// [`init()`][Self::init], whichever comes first.
///
/// # Example
///
/// ```rust
/// use steal_runtime::Engine;
///
/// let engine = Engine::builder().worker_count(2).build();
/// let scheduler = engine.scheduler();
///
/// let answer = scheduler.spawn(|| 6 * 7).unwrap();
/// assert_eq!(*answer.get().unwrap(), 42);
///
/// engine.shutdown();
/// assert!(scheduler.spawn(|| ()).is_err());
/// ```
#[derive(Debug)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Creates an engine with default settings: one worker per hardware thread in each pool.
    ///
    /// Use [`Engine::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Starts the worker threads with `worker_count` workers per pool.
    ///
    /// Zero means one worker per hardware thread, or 4 if that cannot be detected. Only the
    /// first start has any effect: later calls, and calls after the engine started on first use,
    /// succeed without changing anything.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutDown`] after shutdown and [`RuntimeError::WorkerSpawn`] if a
    /// worker thread cannot be started.
    pub fn init(&self, worker_count: usize) -> Result<(), RuntimeError> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(RuntimeError::ShutDown);
        }

        if let Some(pools) = self.shared.pools.get() {
            debug!(
                requested = worker_count,
                running = pools.spawn.worker_count(),
                "engine already initialized"
            );
            return Ok(());
        }

        self.shared.start(worker_count).map(|_| ())
    }

    /// Whether the worker threads have been started.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.shared.pools.get().is_some()
    }

    /// The number of workers in each pool, once started.
    #[must_use]
    pub fn worker_count(&self) -> Option<usize> {
        self.shared.pools.get().map(|pools| pools.spawn.worker_count())
    }

    /// Returns a handle for submitting work to this engine.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops accepting work, waits for all accepted work to finish and stops the workers.
    ///
    /// Calling this more than once is harmless. See [`Pool::shutdown()`] for what happens when
    /// this is called from one of the engine's own workers.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Builder for configuring an [`Engine`].
#[derive(Debug)]
pub struct EngineBuilder {
    worker_count: usize,
    thread_name_prefix: String,
    frame_allocator: Arc<dyn FrameAllocator>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            worker_count: 0,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            frame_allocator: Arc::new(HeapFrameAllocator::new()),
        }
    }

    /// Sets the number of workers in each pool.
    ///
    /// Zero (the default) means one worker per hardware thread. An explicit
    /// [`Engine::init()`] before first use takes precedence.
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the prefix of worker thread names.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the allocator that provides storage for promoted coroutine frames.
    #[must_use]
    pub fn frame_allocator(mut self, allocator: Arc<dyn FrameAllocator>) -> Self {
        self.frame_allocator = allocator;
        self
    }

    /// Creates the engine. Worker threads start on first use.
    #[must_use]
    pub fn build(self) -> Engine {
        Engine {
            shared: Arc::new_cyclic(|self_ref| EngineShared {
                self_ref: Weak::clone(self_ref),
                worker_count: self.worker_count,
                thread_name_prefix: self.thread_name_prefix,
                frames: Arc::new(FrameTable::new(self.frame_allocator)),
                lifecycle: Mutex::new(()),
                pools: OnceLock::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

/// Submits work to an [`Engine`].
///
/// The scheduler can be cloned and shared across threads, including into the tasks it spawns.
/// Every operation that submits work fails with [`RuntimeError::ShutDown`] once the engine has
/// been shut down.
#[derive(Clone, Debug)]
pub struct Scheduler {
    shared: Arc<EngineShared>,
}

impl Scheduler {
    pub(crate) fn from_shared(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Runs `f` on the spawn pool and returns a future for its result.
    ///
    /// When called from a task already running on the spawn pool, `f` goes to the queue of the
    /// calling worker, where idle peers can steal it. From anywhere else, tasks are placed on the
    /// workers round-robin.
    ///
    /// If `f` panics, the future holds [`TaskError::Panicked`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutDown`] if the engine no longer accepts work.
    pub fn spawn<F, R>(&self, f: F) -> Result<Arc<Future<R>>, RuntimeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + Sync + 'static,
    {
        let (invocation, future) = SpawnInvocation::with_future(f);
        self.spawn_invocation(invocation)?;
        Ok(future)
    }

    /// Runs `f` on the spawn pool without tracking its result. Panics are logged.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutDown`] if the engine no longer accepts work.
    pub fn spawn_and_forget<F>(&self, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_invocation(SpawnInvocation::detached(f))
    }

    pub(crate) fn spawn_invocation(&self, invocation: SpawnInvocation) -> Result<(), RuntimeError> {
        self.shared
            .admit()?
            .spawn
            .schedule(invocation)
            .map_err(Rejected::into_reason)
    }

    /// Awaits the result of a call from a coroutine running on its native stack.
    ///
    /// A complete result is returned unchanged, without allocating or touching any shared
    /// state. A pending result promotes `frame`: its locals are copied into a new frame that
    /// waits on the pending callee and continues at the frame's resume point once the callee
    /// completes. The returned `Pending` refers to the new frame and is what the coroutine
    /// reports to its own caller.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::FrameAllocation`] if the frame storage cannot be allocated,
    /// [`RuntimeError::UnknownFrame`] if the pending callee does not exist,
    /// [`RuntimeError::InvalidAffinity`] if the frame is pinned to a worker that does not exist
    /// and [`RuntimeError::ShutDown`] if the engine no longer accepts work.
    pub fn await_result<V>(
        &self,
        result: RampResult<V>,
        frame: StackFrame<'_>,
    ) -> Result<RampResult<V>, RuntimeError> {
        let callee = match result {
            RampResult::Complete(value) => {
                FAST_PATH_AWAITS.with(nm::Event::observe_once);
                return Ok(RampResult::Complete(value));
            }
            RampResult::Pending(callee) => callee,
        };

        let pools = self.shared.admit()?;

        let worker_count = pools.coroutine.worker_count();
        if let Some(worker) = frame
            .affinity()
            .filter(|worker| worker.index() >= worker_count)
        {
            return Err(RuntimeError::InvalidAffinity {
                worker,
                worker_count,
            });
        }

        let (handle, runnable) = self.shared.frames.promote(
            frame.locals(),
            frame.resume_point(),
            frame.affinity(),
            callee,
        )?;

        EngineShared::schedule_resumptions(pools, runnable);
        Ok(RampResult::Pending(handle))
    }

    /// Creates a frame that is completed by an external event rather than resumed.
    ///
    /// Coroutines await it like any other pending callee. Whoever is responsible for the event
    /// resolves it with [`complete_frame()`][Self::complete_frame] or
    /// [`fail_frame()`][Self::fail_frame].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutDown`] if the engine no longer accepts work.
    pub fn new_leaf_frame(&self) -> Result<FrameHandle, RuntimeError> {
        self.shared.admit()?;
        Ok(self.shared.frames.new_leaf())
    }

    /// Completes a suspended frame with `output`, resuming everything that waits on it.
    ///
    /// This remains possible while the engine is draining for shutdown, because the work being
    /// drained may be waiting for this frame.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownFrame`], [`RuntimeError::FrameRunning`] or
    /// [`RuntimeError::FrameAlreadyComplete`] if the frame is not suspended and
    /// [`RuntimeError::ShutDown`] if the engine has finished shutting down.
    pub fn complete_frame(&self, frame: FrameHandle, output: Vec<u8>) -> Result<(), RuntimeError> {
        self.resolve_frame(frame, Ok(output))
    }

    /// Fails a suspended frame. Everything waiting on it fails with
    /// [`TaskError::DependencyFailed`] without being resumed.
    ///
    /// # Errors
    ///
    /// As for [`complete_frame()`][Self::complete_frame].
    pub fn fail_frame(
        &self,
        frame: FrameHandle,
        reason: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        self.resolve_frame(frame, Err(TaskError::Failed(reason.into())))
    }

    fn resolve_frame(
        &self,
        frame: FrameHandle,
        outcome: Result<Vec<u8>, TaskError>,
    ) -> Result<(), RuntimeError> {
        let pools = self.shared.admit_continuation()?;
        let runnable = self.shared.frames.complete(frame, outcome)?;

        EngineShared::schedule_resumptions(pools, runnable);
        Ok(())
    }

    /// Returns a future that receives the frame's output once it completes.
    ///
    /// This is how a thread outside the engine waits for the root of a suspended call chain.
    /// A frame whose outcome has been handed to an observer or a waiting frame is removed, so
    /// this can be called once per completed frame.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownFrame`] if the frame does not exist (any more).
    pub fn observe_frame(&self, frame: FrameHandle) -> Result<Arc<Future<Vec<u8>>>, RuntimeError> {
        self.shared.frames.observe(frame)
    }

    /// Returns a snapshot of the frame's bookkeeping, if the frame exists.
    #[must_use]
    pub fn frame_info(&self, frame: FrameHandle) -> Option<FrameInfo> {
        self.shared.frames.info(frame)
    }

    /// Discards a completed frame whose output nobody is going to consume.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownFrame`] if the frame does not exist and
    /// [`RuntimeError::FrameNotComplete`] if it has not completed yet.
    pub fn release_frame(&self, frame: FrameHandle) -> Result<(), RuntimeError> {
        self.shared.frames.release(frame)
    }

    /// The number of frames currently held by the engine.
    #[must_use]
    pub fn live_frames(&self) -> usize {
        self.shared.frames.live_frames()
    }
}
