//! Spawned tasks: fire-and-forget functions whose result is handed back through a [`Future`].

use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::metrics::SCHEDULING_DELAY_MS;
use crate::{Future, TaskError, WorkItem, WorkerHandle, WorkerId};

/// A type-erased task body that the spawn pool can execute.
///
/// Implementations own whatever the task needs (closure, argument block, result slot) and are
/// responsible for resolving their result slot both when they run and when they are dropped
/// without running.
pub(crate) trait SpawnTask: Send {
    fn run(self: Box<Self>);
}

/// A spawned task queued on the spawn pool.
///
/// Created by [`Scheduler::spawn()`][crate::Scheduler::spawn] and the other spawn entry points.
/// Spawned tasks are never pinned to a worker.
pub struct SpawnInvocation {
    task: Box<dyn SpawnTask>,
}

impl SpawnInvocation {
    pub(crate) fn new(task: Box<dyn SpawnTask>) -> Self {
        Self { task }
    }

    /// Wraps a closure whose result is delivered through the returned future.
    pub(crate) fn with_future<F, R>(body: F) -> (Self, Arc<Future<R>>)
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + Sync + 'static,
    {
        let future = Arc::new(Future::new());

        let task = TypedTask {
            body: Some(body),
            future: Arc::clone(&future),
            spawned_at: Instant::now(),
        };

        (Self::new(Box::new(task)), future)
    }

    /// Wraps a closure whose result nobody is interested in.
    pub(crate) fn detached<F>(body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(Box::new(DetachedTask {
            body,
            spawned_at: Instant::now(),
        }))
    }

    pub(crate) fn run(self) {
        self.task.run();
    }
}

impl WorkItem for SpawnInvocation {
    type Context = ();

    fn affinity(&self) -> Option<WorkerId> {
        None
    }

    fn execute(self, _worker: &WorkerHandle<'_, Self>) {
        self.run();
    }
}

impl fmt::Debug for SpawnInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

fn record_scheduling_delay(spawned_at: Instant) {
    SCHEDULING_DELAY_MS.with(|event| event.observe_millis(spawned_at.elapsed()));
}

struct TypedTask<F, R> {
    // Taken when the task runs. Still present on drop means the task never ran.
    body: Option<F>,
    future: Arc<Future<R>>,
    spawned_at: Instant,
}

impl<F, R> SpawnTask for TypedTask<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + Sync + 'static,
{
    fn run(mut self: Box<Self>) {
        let Some(body) = self.body.take() else {
            return;
        };

        record_scheduling_delay(self.spawned_at);

        let outcome = panic::catch_unwind(AssertUnwindSafe(body))
            .map_err(|payload| TaskError::from_panic(payload.as_ref()));

        if let Err(error) = &outcome {
            debug!(%error, "spawned task failed");
        }

        // We are the only writer, so this can only fail on a logic error that `set` asserts on.
        if self.future.set(outcome).is_err() {
            error!("spawned task result was already set");
        }
    }
}

impl<F, R> Drop for TypedTask<F, R> {
    fn drop(&mut self) {
        if self.body.is_some() && self.future.set(Err(TaskError::Abandoned)).is_err() {
            error!("abandoned task result was already set");
        }
    }
}

struct DetachedTask<F> {
    body: F,
    spawned_at: Instant,
}

impl<F> SpawnTask for DetachedTask<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        let Self { body, spawned_at } = *self;

        record_scheduling_delay(spawned_at);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
            let error = TaskError::from_panic(payload.as_ref());
            error!(%error, "detached task panicked");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SpawnInvocation: Send);

    #[test]
    fn typed_task_delivers_result() {
        let (invocation, future) = SpawnInvocation::with_future(|| 6 * 7);
        assert!(!future.is_complete());

        invocation.run();

        assert_eq!(*future.get().unwrap(), 42);
    }

    #[test]
    fn typed_task_panic_becomes_error() {
        let (invocation, future) = SpawnInvocation::with_future(|| -> u32 { panic!("kaboom") });

        invocation.run();

        assert_eq!(future.get(), Err(TaskError::Panicked("kaboom".to_string())));
    }

    #[test]
    fn dropped_task_is_abandoned() {
        let (invocation, future) = SpawnInvocation::with_future(|| 1_u8);

        drop(invocation);

        assert_eq!(future.get(), Err(TaskError::Abandoned));
    }

    #[test]
    fn future_outlives_task() {
        let (invocation, future) = SpawnInvocation::with_future(|| String::from("kept"));
        invocation.run();

        // The invocation (and its reference to the future) is gone; ours is the last one.
        assert_eq!(Arc::strong_count(&future), 1);
        assert_eq!(future.get().unwrap(), "kept");
    }

    #[test]
    fn detached_task_runs() {
        let ran = Arc::new(AtomicBool::new(false));

        SpawnInvocation::detached({
            let ran = Arc::clone(&ran);
            move || ran.store(true, Ordering::Relaxed)
        })
        .run();

        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn detached_task_panic_is_contained() {
        SpawnInvocation::detached(|| panic!("nobody is listening")).run();
    }
}
