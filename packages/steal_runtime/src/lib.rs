#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Work-stealing execution engine for compiled programs.
//!
//! The engine runs two kinds of work on two pools of worker threads:
//!
//! * **Spawned tasks** are closures (or, through the C ABI, function pointers with an argument
//!   block) whose result is delivered through a blocking [`Future`].
//! * **Coroutine resumptions** continue coroutine frames that suspended while waiting on another
//!   frame. Coroutines run on their caller's native stack and are only promoted to an
//!   engine-owned frame when an await actually suspends, so synchronous completion costs nothing.
//!
//! Each worker prefers its own queue, newest item first, and steals the oldest item from a
//! randomly chosen peer when idle. Work can be pinned to a specific worker.
//!
//! # Quick start
//!
//! ```rust
//! use steal_runtime::Engine;
//!
//! let engine = Engine::builder().worker_count(2).build();
//! let scheduler = engine.scheduler();
//!
//! let nested = scheduler.clone();
//! let outer = scheduler
//!     .spawn(move || nested.spawn(|| 21 * 2).unwrap())
//!     .unwrap();
//!
//! let inner = outer.get().unwrap();
//! assert_eq!(*inner.get().unwrap(), 42);
//! ```
//!
//! # Coroutines
//!
//! ```rust
//! use steal_runtime::{Engine, FrameContext, RampResult, StackFrame};
//!
//! fn add_one(frame: &mut FrameContext) -> RampResult<Vec<u8>> {
//!     let awaited = frame.take_awaited().unwrap_or_default();
//!     let value = awaited.first().copied().unwrap_or_default();
//!     RampResult::Complete(vec![value + 1])
//! }
//!
//! let engine = Engine::builder().worker_count(2).build();
//! let scheduler = engine.scheduler();
//!
//! // Something slow that the coroutine waits on.
//! let leaf = scheduler.new_leaf_frame().unwrap();
//!
//! // The coroutine awaits the leaf. Because the leaf is not done, its frame is promoted.
//! let result = scheduler
//!     .await_result::<Vec<u8>>(RampResult::Pending(leaf), StackFrame::new(&[], add_one))
//!     .unwrap();
//! let coroutine = result.pending_frame().unwrap();
//! let output = scheduler.observe_frame(coroutine).unwrap();
//!
//! scheduler.complete_frame(leaf, vec![41]).unwrap();
//! assert_eq!(output.get().unwrap(), &vec![42]);
//! ```
//!
//! # Shutdown
//!
//! Dropping the [`Engine`] (or calling [`Engine::shutdown()`]) stops accepting new work, waits
//! until every accepted task and resumption has finished (including work they schedule along
//! the way) and then stops the workers. Frames that are still waiting at that point fail with
//! [`TaskError::Abandoned`].
//!
//! # C ABI
//!
//! The `steal_*` functions expose the engine to generated code. See [`RawSpawnTask`] and
//! [`ByteFuture`].

mod abi;
mod allocator;
mod engine;
mod error;
mod frame;
mod future;
mod metrics;
mod pool;
mod queue;
mod ramp;
mod spawn;
mod work_item;
mod worker;

pub use abi::*;
pub use allocator::*;
pub use engine::*;
pub use error::*;
pub use frame::*;
pub(crate) use frame::FrameTable;
pub use future::*;
pub use pool::*;
pub(crate) use pool::PoolShared;
pub(crate) use queue::WorkQueue;
pub use ramp::*;
pub use spawn::*;
pub use work_item::*;
pub use worker::*;
pub(crate) use worker::{IterationResult, WorkerCore};
