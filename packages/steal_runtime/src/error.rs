//! Error types for engine operations and task outcomes.

use std::any::{Any, type_name};
use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::{FrameHandle, WorkerId};

/// An engine operation could not be performed.
///
/// These errors describe misuse of the engine or a lifecycle conflict (e.g. scheduling work after
/// shutdown). They never describe what happened inside a task - see [`TaskError`] for that.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The engine (or pool) has been shut down and no longer accepts work.
    #[error("the engine has been shut down and no longer accepts work")]
    ShutDown,

    /// The operating system refused to start a worker thread.
    #[error("failed to start worker thread")]
    WorkerSpawn(#[source] io::Error),

    /// A coroutine frame could not be promoted because its storage could not be allocated.
    #[error("failed to allocate {size} bytes for a promoted coroutine frame")]
    FrameAllocation {
        /// Number of payload bytes that were requested.
        size: usize,
    },

    /// The frame handle does not refer to a live frame (never existed or already released).
    #[error("frame {0} does not exist or has already been released")]
    UnknownFrame(FrameHandle),

    /// The frame was already complete and cannot be completed again.
    #[error("frame {0} is already complete")]
    FrameAlreadyComplete(FrameHandle),

    /// The frame's resume point is executing, so it cannot be completed from the outside.
    #[error("frame {0} is running")]
    FrameRunning(FrameHandle),

    /// The frame cannot be released because it has not completed yet.
    #[error("frame {0} has not completed yet")]
    FrameNotComplete(FrameHandle),

    /// A work item was pinned to a worker that does not exist in the pool.
    #[error("work item is pinned to worker {worker} but the pool only has {worker_count} workers")]
    InvalidAffinity {
        /// The worker the item was pinned to.
        worker: WorkerId,

        /// The number of workers in the pool.
        worker_count: usize,
    },
}

/// Why a task (spawned function or coroutine frame) did not produce a value.
///
/// Stored as the outcome of a [`Future`][crate::Future] so that anything waiting on the task
/// observes the failure instead of blocking forever.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum TaskError {
    /// The task body panicked. Contains the panic message, if it was a string.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was resolved as failed by whoever was responsible for completing it.
    #[error("task failed: {0}")]
    Failed(String),

    /// A frame this task was (transitively) waiting on failed, so the task was never resumed.
    #[error("a task this task was waiting on failed")]
    DependencyFailed,

    /// The task was discarded without executing because the engine shut down.
    #[error("task was abandoned because the engine shut down before it could execute")]
    Abandoned,
}

impl TaskError {
    /// Converts a panic payload captured by `catch_unwind` into a task error.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        Self::Panicked(message)
    }
}

/// A work item that a pool refused to accept.
///
/// The item is handed back so the caller can decide what to do with it. Dropping it resolves
/// any result slot attached to the item as [`TaskError::Abandoned`].
pub struct Rejected<T> {
    item: T,
    reason: RuntimeError,
}

impl<T> Rejected<T> {
    pub(crate) fn new(item: T, reason: RuntimeError) -> Self {
        Self { item, reason }
    }

    /// Why the item was rejected.
    #[must_use]
    pub fn reason(&self) -> &RuntimeError {
        &self.reason
    }

    /// Recovers the rejected item and the reason it was rejected.
    #[must_use]
    pub fn into_parts(self) -> (T, RuntimeError) {
        (self.item, self.reason)
    }

    /// Discards the item, keeping only the reason.
    #[must_use]
    pub fn into_reason(self) -> RuntimeError {
        self.reason
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work item rejected: {}", self.reason)
    }
}

impl<T> StdError for Rejected<T> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.reason)
    }
}
