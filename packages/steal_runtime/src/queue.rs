//! Per-worker work queue.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::{WorkItem, WorkerId};

/// A worker's private double-ended queue.
///
/// The owning worker pushes and pops at the tail (LIFO), which keeps recently produced work
/// (e.g. a coroutine resumed right after its dependency completed) hot in the cache. Thieves take
/// from the head (FIFO): old work is the least likely to be needed by the owner right away and
/// tends to represent larger chunks of remaining work.
///
/// The lock makes push, pop and steal atomic with respect to each other. It is never held while
/// an item executes.
#[derive(Debug)]
pub(crate) struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T>
where
    T: WorkItem,
{
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Takes the most recently pushed item. Only the owning worker calls this.
    pub(crate) fn pop_local(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Takes the oldest item that `thief` is allowed to execute.
    ///
    /// Items pinned to a different worker are skipped and stay in the queue.
    pub(crate) fn steal(&self, thief: WorkerId) -> Option<T> {
        let mut items = self.items.lock();

        let position = items
            .iter()
            .position(|item| item.affinity().is_none_or(|pinned| pinned == thief))?;

        items.remove(position)
    }

    /// Whether [`steal()`][Self::steal] would currently yield an item for `thief`.
    pub(crate) fn has_stealable(&self, thief: WorkerId) -> bool {
        self.items
            .lock()
            .iter()
            .any(|item| item.affinity().is_none_or(|pinned| pinned == thief))
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
