//! Blocking single-writer, multi-reader result slot.

use std::any::type_name;
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::TaskError;

/// The eventual outcome of a task, written once by the worker that finishes the task and read
/// any number of times by any number of threads.
///
/// Reading blocks the calling thread until the outcome is available. This is also allowed on
/// worker threads, at the cost of that worker not executing other work while it is blocked.
///
/// The outcome is a `Result`: if the task panicked, was abandoned at shutdown or depended on a
/// failed coroutine frame, readers observe the corresponding [`TaskError`] instead of blocking
/// forever.
///
/// # Ordering
///
/// Everything the writer did before [`set()`][Self::set] happens-before anything a reader does
/// after observing the outcome.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::thread;
///
/// use steal_runtime::Future;
///
/// let future = Arc::new(Future::new());
///
/// let writer = thread::spawn({
///     let future = Arc::clone(&future);
///     move || future.set(Ok(42)).unwrap()
/// });
///
/// assert_eq!(*future.get().unwrap(), 42);
/// writer.join().unwrap();
/// ```
pub struct Future<T> {
    outcome: OnceLock<Result<T, TaskError>>,

    // Guards the handoff between the writer and blocked readers. The flag flips only after
    // `outcome` has been stored.
    completed: Mutex<bool>,
    ready: Condvar,
}

impl<T> Future<T> {
    /// Creates a future that has not been completed yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            outcome: OnceLock::new(),
            completed: Mutex::new(false),
            ready: Condvar::new(),
        }
    }

    /// Stores the outcome and wakes every thread blocked on this future.
    ///
    /// A future can only be completed once. Completing it a second time is a programming
    /// error: debug builds panic, release builds hand the rejected outcome back to the caller.
    ///
    /// # Errors
    ///
    /// Returns the outcome unchanged if the future was already complete.
    pub fn set(&self, outcome: Result<T, TaskError>) -> Result<(), Result<T, TaskError>> {
        if let Err(rejected) = self.outcome.set(outcome) {
            debug_assert!(false, "{} completed twice", type_name::<Self>());
            return Err(rejected);
        }

        let mut completed = self.completed.lock();
        *completed = true;
        drop(completed);

        self.ready.notify_all();
        Ok(())
    }

    /// Blocks until the outcome is available and returns it.
    ///
    /// # Errors
    ///
    /// Returns the [`TaskError`] the producing task failed with.
    pub fn get(&self) -> Result<&T, TaskError> {
        loop {
            if let Some(outcome) = self.try_get() {
                return outcome;
            }

            let mut completed = self.completed.lock();
            if !*completed {
                self.ready.wait(&mut completed);
            }
        }
    }

    /// Blocks until the outcome is available or the timeout elapses.
    ///
    /// Returns `None` if the future was still incomplete when the timeout elapsed.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<&T, TaskError>> {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if let Some(outcome) = self.try_get() {
                return Some(outcome);
            }

            let mut completed = self.completed.lock();
            if *completed {
                continue;
            }

            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut completed, deadline).timed_out() {
                        drop(completed);
                        return self.try_get();
                    }
                }
                // The timeout is so large that it cannot be represented - that is just "forever".
                None => self.ready.wait(&mut completed),
            }
        }
    }

    /// Returns the outcome if it is already available, without blocking.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<&T, TaskError>> {
        self.outcome
            .get()
            .map(|outcome| outcome.as_ref().map_err(Clone::clone))
    }

    /// Whether the outcome has been stored.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcome.get().is_some()
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("is_complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}
