use derive_more::Display;

use crate::WorkerHandle;

/// Identifies one worker thread within a pool. Worker ids are dense, starting from zero.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[display("{_0}")]
pub struct WorkerId(usize);

impl WorkerId {
    /// Creates a worker id from its index within the pool.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The index of the worker within the pool.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A unit of work that a [`Pool`][crate::Pool] can schedule and execute.
///
/// Every pool is dedicated to one kind of work item. The engine uses two: spawned functions
/// ([`SpawnInvocation`][crate::SpawnInvocation]) and coroutine frame resumptions
/// ([`CoroutineResumption`][crate::CoroutineResumption]). Both share the same stealing algorithm.
///
/// Work items are executed inline on the worker that obtained them. An item dropped without
/// being executed (because the pool rejected it during shutdown) must resolve whatever result
/// slot it carries, so that nobody waits on it forever.
pub trait WorkItem: Send + Sized + 'static {
    /// State shared by all items of this kind, owned by the pool and handed to every execution.
    type Context: Send + Sync + 'static;

    /// The worker this item is pinned to, if any.
    ///
    /// A pinned item is only ever executed by that worker: other workers skip it when stealing.
    /// This exists for work that captures thread-affine resources.
    fn affinity(&self) -> Option<WorkerId>;

    /// Executes the item on the current worker.
    fn execute(self, worker: &WorkerHandle<'_, Self>);
}
