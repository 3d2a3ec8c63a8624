//! Worker thread logic: obtaining work from the local queue or by stealing, and executing it.

use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use rand::seq::SliceRandom;
use tracing::{error, trace};

use crate::metrics::{EXECUTION_TIME_MS, ITEMS_EXECUTED, ITEMS_STOLEN};
use crate::{PoolShared, Rejected, TaskError, WorkItem, WorkerId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum IterationResult {
    ExecutedLocal,
    ExecutedStolen,
    Shutdown,
    Idle,
}

/// The view of the pool that a work item gets while it executes.
pub struct WorkerHandle<'a, T>
where
    T: WorkItem,
{
    shared: &'a PoolShared<T>,
    id: WorkerId,
}

impl<'a, T> WorkerHandle<'a, T>
where
    T: WorkItem,
{
    pub(crate) fn new(shared: &'a PoolShared<T>, id: WorkerId) -> Self {
        Self { shared, id }
    }

    /// The worker executing the current item.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The state shared by all items of this pool.
    #[must_use]
    pub fn context(&self) -> &'a T::Context {
        &self.shared.context
    }

    /// Schedules another item on the same pool.
    ///
    /// Unpinned items go to the current worker's own queue, where they are the next thing this
    /// worker executes unless someone steals them first. Work scheduled from a worker is
    /// accepted even while the pool is draining for shutdown.
    ///
    /// # Errors
    ///
    /// Returns the item if it is pinned to a worker that does not exist.
    pub fn schedule(&self, item: T) -> Result<(), Rejected<T>> {
        self.shared.schedule(item)
    }
}

impl<T> fmt::Debug for WorkerHandle<'_, T>
where
    T: WorkItem,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pool_id", &self.shared.pool_id)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// One worker's view of the pool, executing one item per iteration.
pub(crate) struct WorkerCore<'a, T>
where
    T: WorkItem,
{
    shared: &'a PoolShared<T>,
    id: WorkerId,

    // Every other worker in the pool. Reshuffled before each steal attempt so that idle
    // workers do not all converge on the same victim.
    victims: Vec<WorkerId>,
}

impl<'a, T> WorkerCore<'a, T>
where
    T: WorkItem,
{
    pub(crate) fn new(shared: &'a PoolShared<T>, id: WorkerId) -> Self {
        let victims = (0..shared.queues.len())
            .map(WorkerId::new)
            .filter(|&victim| victim != id)
            .collect();

        Self {
            shared,
            id,
            victims,
        }
    }

    pub(crate) fn run_one_iteration(&mut self) -> IterationResult {
        // Acquire ordering synchronizes with the Release in `PoolShared::signal_stop()`, which
        // is only issued after every scheduled item has finished executing.
        if self.shared.stop_flag.load(Ordering::Acquire) {
            return IterationResult::Shutdown;
        }

        if let Some(item) = self.shared.queue(self.id).pop_local() {
            self.execute(item);
            return IterationResult::ExecutedLocal;
        }

        if let Some((victim, item)) = self.steal() {
            trace!(pool_id = self.shared.pool_id, worker = %self.id, %victim, "stole work item");
            ITEMS_STOLEN.with(nm::Event::observe_once);

            self.execute(item);
            return IterationResult::ExecutedStolen;
        }

        IterationResult::Idle
    }

    fn steal(&mut self) -> Option<(WorkerId, T)> {
        self.victims.shuffle(&mut rand::rng());

        self.victims.iter().find_map(|&victim| {
            self.shared
                .queue(victim)
                .steal(self.id)
                .map(|item| (victim, item))
        })
    }

    fn execute(&self, item: T) {
        let handle = WorkerHandle::new(self.shared, self.id);

        // Work items trap their own panics and turn them into task outcomes. Anything that
        // still escapes must not take the worker down with it, or the pool would never drain.
        let result = EXECUTION_TIME_MS.with(|event| {
            event.observe_duration_millis(|| {
                panic::catch_unwind(AssertUnwindSafe(|| item.execute(&handle)))
            })
        });

        if let Err(payload) = result {
            let error = TaskError::from_panic(payload.as_ref());
            error!(
                pool_id = self.shared.pool_id,
                worker = %self.id,
                %error,
                "work item panicked outside of its own panic trap"
            );
        }

        ITEMS_EXECUTED.with(nm::Event::observe_once);
        self.shared.finish_one();
    }
}
