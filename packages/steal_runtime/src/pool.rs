//! Pool management and lifecycle.

use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::num::NonZero;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle as ThreadJoinHandle};

use crossbeam::utils::Backoff;
use event_listener::{Event, Listener};
use new_zealand::nz;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{IterationResult, Rejected, RuntimeError, WorkItem, WorkQueue, WorkerCore, WorkerId};

/// Used when the requested worker count is zero and the hardware concurrency cannot be detected.
pub(crate) const FALLBACK_WORKER_COUNT: NonZero<usize> = nz!(4);

const DEFAULT_THREAD_NAME: &str = "steal-worker";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Resolves a requested worker count, where zero means "one per hardware thread".
pub(crate) fn resolve_worker_count(requested: usize) -> NonZero<usize> {
    NonZero::new(requested).unwrap_or_else(|| {
        thread::available_parallelism().unwrap_or_else(|e| {
            warn!(
                error = %e,
                fallback = FALLBACK_WORKER_COUNT.get(),
                "cannot detect hardware concurrency"
            );
            FALLBACK_WORKER_COUNT
        })
    })
}

#[derive(Clone, Copy, Debug)]
struct WorkerSlot {
    tracker_id: u64,
    pool_id: u64,
    worker: WorkerId,
}

thread_local! {
    // Set for the lifetime of every worker thread, so scheduling can tell work produced by a
    // running item apart from work submitted from the outside.
    static CURRENT_WORKER: Cell<Option<WorkerSlot>> = const { Cell::new(None) };
}

/// Admission control shared by every pool that participates in one drain.
///
/// Counts items from the moment they are admitted until they finish executing. Because an item
/// that schedules more work does so while it is itself still counted, the counter can only reach
/// zero once the whole transitive closure of work has executed.
#[derive(Debug)]
pub(crate) struct WorkTracker {
    id: u64,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Event,
}

impl WorkTracker {
    pub(crate) fn new() -> Self {
        Self {
            id: next_id(),
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Event::new(),
        }
    }

    /// Whether the current thread is a worker of a pool attached to this tracker.
    pub(crate) fn is_current_thread_internal(&self) -> bool {
        CURRENT_WORKER
            .get()
            .is_some_and(|slot| slot.tracker_id == self.id)
    }

    /// Counts one more item as in flight, unless the tracker no longer accepts it.
    ///
    /// Internal work (scheduled by a running item) is admitted even after `close()`.
    pub(crate) fn try_admit(&self, internal: bool) -> bool {
        // SeqCst on both sides of the admission race with `close()`: either the closing thread
        // sees our increment and waits for it, or we see the closed flag and back out.
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        if internal || self.accepting.load(Ordering::SeqCst) {
            return true;
        }

        self.finish_one();
        false
    }

    /// Counts a continuation of already admitted work as in flight.
    ///
    /// Continuations (such as resuming a frame whose dependency just completed) are admitted
    /// after `close()` for as long as the drain has not finished, because the drain may be
    /// waiting on exactly that continuation.
    pub(crate) fn try_admit_continuation(&self) -> bool {
        let previous = self.in_flight.fetch_add(1, Ordering::SeqCst);

        if previous > 0 || self.accepting.load(Ordering::SeqCst) {
            return true;
        }

        self.finish_one();
        false
    }

    pub(crate) fn finish_one(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "in-flight counter underflow");

        if previous == 1 {
            self.drained.notify(usize::MAX);
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stops admitting external work. Idempotent.
    pub(crate) fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Blocks until every admitted item has executed.
    #[cfg_attr(test, mutants::skip)] // Returning early makes the drain tests race.
    pub(crate) fn wait_drained(&self) {
        while self.in_flight() != 0 {
            let listener = self.drained.listen();

            // Re-check after registering the listener to avoid a lost wakeup.
            if self.in_flight() == 0 {
                break;
            }

            listener.wait();
        }
    }
}

/// State shared between a pool's owner and its worker threads.
pub(crate) struct PoolShared<T>
where
    T: WorkItem,
{
    pub(crate) pool_id: u64,
    pub(crate) queues: Box<[WorkQueue<T>]>,
    pub(crate) context: T::Context,
    pub(crate) tracker: Arc<WorkTracker>,
    pub(crate) stop_flag: AtomicBool,

    // Placement counter for work submitted from outside the pool.
    next_worker: AtomicUsize,

    // Notified on every push and on stop. Idle workers park on it.
    work_available: Event,
}

impl<T> PoolShared<T>
where
    T: WorkItem,
{
    pub(crate) fn new(worker_count: usize, context: T::Context) -> Self {
        Self::with_tracker(worker_count, context, Arc::new(WorkTracker::new()))
    }

    pub(crate) fn with_tracker(
        worker_count: usize,
        context: T::Context,
        tracker: Arc<WorkTracker>,
    ) -> Self {
        // All queues exist before any worker thread can index into them.
        let queues = (0..worker_count).map(|_| WorkQueue::new()).collect();

        Self {
            pool_id: next_id(),
            queues,
            context,
            tracker,
            stop_flag: AtomicBool::new(false),
            next_worker: AtomicUsize::new(0),
            work_available: Event::new(),
        }
    }

    pub(crate) fn queue(&self, worker: WorkerId) -> &WorkQueue<T> {
        self.queues
            .get(worker.index())
            .expect("worker ids are only ever created for workers that exist in the pool")
    }

    pub(crate) fn schedule(&self, item: T) -> Result<(), Rejected<T>> {
        self.schedule_as(item, false)
    }

    /// Schedules an item that continues work admitted earlier, see
    /// [`WorkTracker::try_admit_continuation()`].
    pub(crate) fn schedule_continuation(&self, item: T) -> Result<(), Rejected<T>> {
        self.schedule_as(item, true)
    }

    /// Work scheduled from a worker goes to that worker's own queue so that it stays close to
    /// the data its producer just touched. Work from outside the pool is placed round-robin.
    fn schedule_as(&self, item: T, continuation: bool) -> Result<(), Rejected<T>> {
        let worker_count = self.queues.len();
        let pinned = item.affinity();

        if let Some(worker) = pinned.filter(|worker| worker.index() >= worker_count) {
            return Err(Rejected::new(
                item,
                RuntimeError::InvalidAffinity {
                    worker,
                    worker_count,
                },
            ));
        }

        let current = CURRENT_WORKER
            .get()
            .filter(|slot| slot.tracker_id == self.tracker.id);

        let admitted = if current.is_none() && continuation {
            self.tracker.try_admit_continuation()
        } else {
            self.tracker.try_admit(current.is_some())
        };

        if !admitted {
            warn!(
                pool_id = self.pool_id,
                "rejected work item because the pool is shutting down"
            );
            return Err(Rejected::new(item, RuntimeError::ShutDown));
        }

        let target = pinned.unwrap_or_else(|| match current {
            Some(slot) if slot.pool_id == self.pool_id => slot.worker,
            _ => {
                // Relaxed is enough: the counter only spreads work, it orders nothing.
                let next = self.next_worker.fetch_add(1, Ordering::Relaxed);
                WorkerId::new(next.checked_rem(worker_count).unwrap_or_default())
            }
        });

        trace!(
            pool_id = self.pool_id,
            worker = %target,
            pinned = pinned.is_some(),
            "placed work item"
        );
        self.queue(target).push(item);

        if pinned.is_some() {
            // Only one worker may take it, so waking one arbitrary worker is not enough.
            self.work_available.notify(usize::MAX);
        } else {
            self.work_available.notify(1);
        }

        Ok(())
    }

    pub(crate) fn finish_one(&self) {
        self.tracker.finish_one();
    }

    /// Whether `worker` would find something to execute right now.
    pub(crate) fn has_work_for(&self, worker: WorkerId) -> bool {
        self.queues.iter().enumerate().any(|(index, queue)| {
            if index == worker.index() {
                !queue.is_empty()
            } else {
                queue.has_stealable(worker)
            }
        })
    }

    #[cfg_attr(test, mutants::skip)] // Removing this causes timeouts (workers never stop).
    pub(crate) fn signal_stop(&self) {
        // Release ordering ensures everything the drained items did is visible to workers
        // before they observe the stop flag.
        self.stop_flag.store(true, Ordering::Release);
        self.work_available.notify(usize::MAX);
    }
}

impl<T> fmt::Debug for PoolShared<T>
where
    T: WorkItem,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pool_id", &self.pool_id)
            .field("worker_count", &self.queues.len())
            .field("in_flight", &self.tracker.in_flight())
            .field("stop_flag", &self.stop_flag.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn worker_loop<T>(shared: &PoolShared<T>, id: WorkerId)
where
    T: WorkItem,
{
    let mut core = WorkerCore::new(shared, id);
    let backoff = Backoff::new();

    loop {
        match core.run_one_iteration() {
            IterationResult::ExecutedLocal | IterationResult::ExecutedStolen => {
                backoff.reset();
            }
            IterationResult::Shutdown => {
                break;
            }
            IterationResult::Idle => {
                if !backoff.is_completed() {
                    backoff.snooze();
                    continue;
                }

                let listener = shared.work_available.listen();

                // Re-check after registering the listener to avoid lost wakeups.
                // Acquire ordering synchronizes with the Release in signal_stop.
                if shared.stop_flag.load(Ordering::Acquire) || shared.has_work_for(id) {
                    continue;
                }

                listener.wait();
                backoff.reset();
            }
        }
    }
}

/// A fixed set of worker threads executing one kind of [`WorkItem`] with work stealing.
///
/// Each worker owns a queue. Work scheduled from outside the pool is placed round-robin, work
/// scheduled by a running item goes to the queue of the worker running it and work pinned to a
/// worker goes to that worker's queue. Idle workers steal the oldest work from other queues.
///
/// # Lifetime
///
/// [`shutdown()`][Self::shutdown] (also performed on drop) stops accepting work from outside the
/// pool, waits until every accepted item has executed, including any work those items schedule,
/// and then joins all worker threads.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use steal_runtime::{Pool, WorkItem, WorkerHandle, WorkerId};
///
/// struct Increment;
///
/// impl WorkItem for Increment {
///     type Context = AtomicUsize;
///
///     fn affinity(&self) -> Option<WorkerId> {
///         None
///     }
///
///     fn execute(self, worker: &WorkerHandle<'_, Self>) {
///         worker.context().fetch_add(1, Ordering::Relaxed);
///     }
/// }
///
/// let pool = Pool::<Increment>::builder()
///     .worker_count(2)
///     .build(AtomicUsize::new(0))
///     .unwrap();
///
/// for _ in 0..10 {
///     pool.schedule(Increment).unwrap();
/// }
///
/// pool.shutdown();
/// assert_eq!(pool.context().load(Ordering::Relaxed), 10);
/// ```
pub struct Pool<T>
where
    T: WorkItem,
{
    shared: Arc<PoolShared<T>>,
    worker_threads: Mutex<Vec<ThreadJoinHandle<()>>>,
}

impl<T> Pool<T>
where
    T: WorkItem,
{
    /// Creates a builder for configuring the pool.
    #[must_use]
    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder::new()
    }

    /// Schedules an item for execution on one of the workers.
    ///
    /// Pinned items go to their worker. Otherwise an item scheduled by a running item lands on
    /// the queue of the worker that runs it, and an item scheduled from outside the pool is
    /// placed round-robin.
    ///
    /// # Errors
    ///
    /// Hands the item back if the pool is shutting down or the item is pinned to a worker that
    /// does not exist.
    pub fn schedule(&self, item: T) -> Result<(), Rejected<T>> {
        self.shared.schedule(item)
    }

    pub(crate) fn schedule_continuation(&self, item: T) -> Result<(), Rejected<T>> {
        self.shared.schedule_continuation(item)
    }

    /// The number of worker threads in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.queues.len()
    }

    /// The state shared by all items of this pool.
    #[must_use]
    pub fn context(&self) -> &T::Context {
        &self.shared.context
    }

    /// Whether the pool has stopped accepting work from outside.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        !self.shared.tracker.is_accepting()
    }

    /// Stops accepting work, waits for all accepted work to execute and joins the workers.
    ///
    /// Calling this more than once is harmless. When called from one of the pool's own workers,
    /// the pool cannot wait for itself: it stops the workers without waiting and any work still
    /// queued is dropped unexecuted.
    pub fn shutdown(&self) {
        self.shared.tracker.close();

        if self.shared.tracker.is_current_thread_internal() {
            warn!(
                pool_id = self.shared.pool_id,
                "pool shut down from its own worker thread, queued work is abandoned"
            );
            self.shared.signal_stop();
            self.worker_threads.lock().clear();
            return;
        }

        self.shared.tracker.wait_drained();
        self.stop_and_join();
    }

    /// Raises the stop flag and joins the worker threads, without waiting for queued work.
    #[cfg_attr(test, mutants::skip)] // Removing this causes timeouts (workers never stop).
    pub(crate) fn stop_and_join(&self) {
        self.shared.signal_stop();

        let handles = mem::take(&mut *self.worker_threads.lock());

        for handle in handles {
            if let Err(payload) = handle.join() {
                // Worker threads trap panics from work items, so this is a failure of the pool
                // itself. Propagate it rather than silently losing it.
                panic::resume_unwind(payload);
            }
        }
    }
}

impl<T> Drop for Pool<T>
where
    T: WorkItem,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T> fmt::Debug for Pool<T>
where
    T: WorkItem,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`Pool`] of `T` items.
pub struct PoolBuilder<T> {
    worker_count: usize,
    thread_name: String,
    tracker: Option<Arc<WorkTracker>>,
    _item: PhantomData<fn() -> T>,
}

impl<T> PoolBuilder<T>
where
    T: WorkItem,
{
    /// Creates a builder with default settings: one worker per hardware thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_count: 0,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            tracker: None,
            _item: PhantomData,
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Zero (the default) means one worker per hardware thread, or 4 if that cannot be detected.
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the prefix of worker thread names. Each thread is named `{prefix}-{index}`.
    #[must_use]
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// Makes the pool part of a drain shared with other pools.
    pub(crate) fn tracker(mut self, tracker: Arc<WorkTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Starts the worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::WorkerSpawn`] if the operating system refuses to start a thread.
    /// Any workers already started are stopped again before returning.
    pub fn build(self, context: T::Context) -> Result<Pool<T>, RuntimeError> {
        let worker_count = resolve_worker_count(self.worker_count).get();
        let tracker = self.tracker.unwrap_or_else(|| Arc::new(WorkTracker::new()));

        let shared = Arc::new(PoolShared::with_tracker(worker_count, context, tracker));

        let pool = Pool {
            shared,
            worker_threads: Mutex::new(Vec::with_capacity(worker_count)),
        };

        for index in 0..worker_count {
            let shared = Arc::clone(&pool.shared);
            let worker = WorkerId::new(index);

            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", self.thread_name))
                .spawn(move || {
                    CURRENT_WORKER.set(Some(WorkerSlot {
                        tracker_id: shared.tracker.id,
                        pool_id: shared.pool_id,
                        worker,
                    }));

                    debug!(pool_id = shared.pool_id, %worker, "worker thread started");
                    worker_loop(&shared, worker);
                    debug!(pool_id = shared.pool_id, %worker, "worker thread exiting");
                });

            match spawned {
                Ok(handle) => pool.worker_threads.lock().push(handle),
                Err(e) => {
                    // Nothing has been admitted yet, so there is nothing to drain.
                    pool.shared.tracker.close();
                    pool.stop_and_join();
                    return Err(RuntimeError::WorkerSpawn(e));
                }
            }
        }

        debug!(pool_id = pool.shared.pool_id, worker_count, "pool started");
        Ok(pool)
    }
}

impl<T> Default for PoolBuilder<T>
where
    T: WorkItem,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PoolBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("worker_count", &self.worker_count)
            .field("thread_name", &self.thread_name)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::WorkerHandle;

    assert_impl_all!(PoolBuilder<Counted>: Send, Sync);

    #[derive(Debug, Default)]
    struct Counters {
        executed: AtomicUsize,
        wrong_worker: AtomicUsize,
    }

    /// Counts its execution and, while `fan_out` is non-zero, schedules two more of itself.
    #[derive(Debug)]
    struct Counted {
        fan_out: u32,
        affinity: Option<WorkerId>,
    }

    impl WorkItem for Counted {
        type Context = Counters;

        fn affinity(&self) -> Option<WorkerId> {
            self.affinity
        }

        fn execute(self, worker: &WorkerHandle<'_, Self>) {
            let counters = worker.context();
            counters.executed.fetch_add(1, Ordering::Relaxed);

            if self.affinity.is_some_and(|pinned| pinned != worker.id()) {
                counters.wrong_worker.fetch_add(1, Ordering::Relaxed);
            }

            if let Some(fan_out) = self.fan_out.checked_sub(1) {
                for _ in 0..2 {
                    worker
                        .schedule(Counted {
                            fan_out,
                            affinity: None,
                        })
                        .unwrap();
                }
            }
        }
    }

    fn pool(worker_count: usize) -> Pool<Counted> {
        Pool::builder()
            .worker_count(worker_count)
            .thread_name("pool-test")
            .build(Counters::default())
            .unwrap()
    }

    #[test]
    fn zero_resolves_to_detected_parallelism() {
        let resolved = resolve_worker_count(0);

        let expected = thread::available_parallelism().unwrap_or(FALLBACK_WORKER_COUNT);
        assert_eq!(resolved, expected);
    }

    #[test]
    fn explicit_worker_count_is_kept() {
        assert_eq!(resolve_worker_count(3).get(), 3);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn builder_creates_requested_workers() {
        with_watchdog(|| {
            let pool = pool(3);
            assert_eq!(pool.worker_count(), 3);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shutdown_drains_nested_work() {
        with_watchdog(|| {
            let pool = pool(2);

            // 1 + 2 + 4 + ... + 2^6 = 127 items.
            pool.schedule(Counted {
                fan_out: 6,
                affinity: None,
            })
            .unwrap();

            pool.shutdown();
            assert_eq!(pool.context().executed.load(Ordering::Relaxed), 127);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shutdown_is_idempotent_and_rejects_further_work() {
        with_watchdog(|| {
            let pool = pool(2);
            pool.shutdown();
            pool.shutdown();

            assert!(pool.is_shut_down());

            let rejected = pool
                .schedule(Counted {
                    fan_out: 0,
                    affinity: None,
                })
                .unwrap_err();
            assert!(matches!(rejected.reason(), RuntimeError::ShutDown));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn pinned_work_runs_on_its_worker() {
        with_watchdog(|| {
            let pool = pool(4);

            for round in 0..200 {
                pool.schedule(Counted {
                    fan_out: 0,
                    affinity: Some(WorkerId::new(round % 4)),
                })
                .unwrap();
            }

            pool.shutdown();

            let counters = pool.context();
            assert_eq!(counters.executed.load(Ordering::Relaxed), 200);
            assert_eq!(counters.wrong_worker.load(Ordering::Relaxed), 0);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn out_of_range_affinity_is_rejected() {
        with_watchdog(|| {
            let pool = pool(2);

            let rejected = pool
                .schedule(Counted {
                    fan_out: 0,
                    affinity: Some(WorkerId::new(2)),
                })
                .unwrap_err();

            assert!(matches!(
                rejected.reason(),
                RuntimeError::InvalidAffinity {
                    worker_count: 2,
                    ..
                }
            ));
        });
    }

    #[test]
    fn closed_tracker_only_admits_internal_work() {
        let tracker = WorkTracker::new();
        tracker.close();

        assert!(!tracker.try_admit(false));
        assert_eq!(tracker.in_flight(), 0);

        assert!(tracker.try_admit(true));
        assert_eq!(tracker.in_flight(), 1);

        tracker.finish_one();
        tracker.wait_drained();
    }

    #[test]
    fn continuation_is_admitted_only_while_drain_is_pending() {
        let tracker = WorkTracker::new();
        assert!(tracker.try_admit(false));
        tracker.close();

        // Something admitted earlier is still running, so the drain must also cover this.
        assert!(tracker.try_admit_continuation());
        assert_eq!(tracker.in_flight(), 2);

        tracker.finish_one();
        tracker.finish_one();
        tracker.wait_drained();

        // Once drained, nothing can be waiting on a continuation anymore.
        assert!(!tracker.try_admit_continuation());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn continuation_is_admitted_while_accepting() {
        let tracker = WorkTracker::new();

        assert!(tracker.try_admit_continuation());
        assert_eq!(tracker.in_flight(), 1);

        tracker.finish_one();
    }

    #[test]
    fn external_placement_is_round_robin() {
        let shared = PoolShared::<Counted>::new(3, Counters::default());

        for _ in 0..6 {
            shared
                .schedule(Counted {
                    fan_out: 0,
                    affinity: None,
                })
                .unwrap();
        }

        assert!(shared.queues.iter().all(|queue| queue.len() == 2));
    }
}
