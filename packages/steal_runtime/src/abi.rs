//! C ABI entry points for compiled programs.
//!
//! Generated code cannot name Rust generics, so results cross this boundary as fixed-size byte
//! buffers ([`ByteFuture`]) and spawned functions as plain function pointers with an argument
//! block ([`RawSpawnTask`]).
//!
//! Ownership rules:
//!
//! * An engine created by [`steal_engine_create`] is owned by the caller until passed to
//!   [`steal_engine_free`], which waits for all accepted work to finish.
//! * A future created by [`steal_future_create`] is reference counted. The caller's reference is
//!   released by [`steal_future_free`]; a scheduled task holds its own reference, so the caller
//!   may free the future before the task has written its result.
//! * An argument block allocated by [`steal_args_alloc`] belongs to the engine once the task that
//!   carries it has been passed to [`steal_spawn_schedule`], and is freed after the task runs.

use std::alloc::{self, Layout};
use std::any::type_name;
use std::fmt;
use std::ptr;
use std::slice;
use std::sync::Arc;

use tracing::{error, warn};

use crate::spawn::SpawnTask;
use crate::{Engine, Future, RuntimeError, SpawnInvocation, TaskError};

/// The operation succeeded.
pub const STEAL_OK: i32 = 0;

/// The engine has been shut down and no longer accepts work.
pub const STEAL_ERR_SHUT_DOWN: i32 = -1;

/// A pointer argument was null or otherwise unusable.
pub const STEAL_ERR_INVALID_ARGUMENT: i32 = -2;

/// The operating system refused to provide a resource (threads, memory).
pub const STEAL_ERR_RESOURCE_EXHAUSTED: i32 = -3;

/// Alignment of argument blocks. Enough for any scalar the code generator bundles into them.
const ARGS_ALIGN: usize = 16;

fn status(error: &RuntimeError) -> i32 {
    match error {
        RuntimeError::ShutDown => STEAL_ERR_SHUT_DOWN,
        RuntimeError::WorkerSpawn(_) | RuntimeError::FrameAllocation { .. } => {
            STEAL_ERR_RESOURCE_EXHAUSTED
        }
        _ => STEAL_ERR_INVALID_ARGUMENT,
    }
}

/// A type-erased result slot with a fixed-size byte buffer.
///
/// The size is chosen when the future is created and every successful result is exactly that
/// many bytes.
pub struct ByteFuture {
    size: usize,
    inner: Future<Box<[u8]>>,
}

impl ByteFuture {
    /// Creates an incomplete future whose result is `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            inner: Future::new(),
        }
    }

    /// The size of the result in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stores a copy of `value` as the result and wakes all waiters.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not exactly [`size()`][Self::size] bytes long.
    pub fn set(&self, value: &[u8]) {
        assert_eq!(
            value.len(),
            self.size,
            "result does not match the size the future was created with"
        );

        self.resolve(Ok(value.into()));
    }

    /// Completes the future with an error.
    pub fn fail(&self, error: TaskError) {
        self.resolve(Err(error));
    }

    fn resolve(&self, outcome: Result<Box<[u8]>, TaskError>) {
        if self.inner.set(outcome).is_err() {
            error!("byte future completed twice, keeping the first result");
        }
    }

    /// Blocks until the result is available.
    ///
    /// # Errors
    ///
    /// Returns the [`TaskError`] the producing task failed with.
    pub fn get(&self) -> Result<&[u8], TaskError> {
        self.inner.get().map(|bytes| &**bytes)
    }

    /// Whether the future has been completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }
}

impl fmt::Debug for ByteFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("size", &self.size)
            .field("inner", &self.inner)
            .finish()
    }
}

/// A spawned function as described by generated code.
///
/// The engine calls `function` with a pointer to this structure. The function reads its
/// arguments from `args` and reports its result by calling `completion` with `future` and a
/// pointer to the result bytes. [`steal_future_set`] is a suitable `completion`.
#[repr(C)]
#[derive(Debug)]
#[expect(
    clippy::exhaustive_structs,
    reason = "layout is shared with generated code and cannot grow"
)]
pub struct RawSpawnTask {
    /// The function to run.
    pub function: unsafe extern "C" fn(task: *const RawSpawnTask),

    /// Argument block from [`steal_args_alloc`], or null.
    pub args: *mut u8,

    /// Size of the argument block in bytes, as passed to [`steal_args_alloc`].
    pub args_size: usize,

    /// Future from [`steal_future_create`], or null if nobody wants the result.
    pub future: *const ByteFuture,

    /// Writes the result into the future.
    pub completion: unsafe extern "C" fn(future: *const ByteFuture, result: *const u8),
}

/// Owns a scheduled raw task: frees its argument block and holds a reference to its future.
struct RawTaskAdapter {
    task: RawSpawnTask,
    future: Option<Arc<ByteFuture>>,
}

// SAFETY: After scheduling, the argument block is owned exclusively by this adapter and the
// future is an `Arc`-managed `ByteFuture`, which is `Sync`. Generated code promises that its
// spawned functions may run on any thread.
unsafe impl Send for RawTaskAdapter {}

impl RawTaskAdapter {
    /// # Safety
    ///
    /// The pointers in `task` must satisfy the contract of [`steal_spawn_schedule`].
    unsafe fn new(task: RawSpawnTask) -> Self {
        let future = if task.future.is_null() {
            None
        } else {
            // SAFETY: The caller guarantees the future came from `steal_future_create` and the
            // caller's reference is still alive, so we can take an additional reference.
            unsafe {
                Arc::increment_strong_count(task.future);
            }

            // SAFETY: We own the reference we just added.
            Some(unsafe { Arc::from_raw(task.future) })
        };

        Self { task, future }
    }
}

impl SpawnTask for RawTaskAdapter {
    fn run(mut self: Box<Self>) {
        // SAFETY: The function pointer and the task layout are provided by generated code that
        // honors the `RawSpawnTask` contract. The task outlives the call.
        unsafe {
            (self.task.function)(&raw const self.task);
        }

        let Some(future) = self.future.take() else {
            return;
        };

        if !future.is_complete() {
            warn!("spawned function returned without completing its future");
            future.fail(TaskError::Failed(
                "spawned function returned without completing its future".to_string(),
            ));
        }
    }
}

impl Drop for RawTaskAdapter {
    fn drop(&mut self) {
        // Still holding the future means the task never ran.
        if let Some(future) = self.future.take() {
            future.fail(TaskError::Abandoned);
        }

        // SAFETY: The argument block was allocated by `steal_args_alloc` with this size and
        // ownership passed to us when the task was scheduled.
        unsafe {
            steal_args_free(self.task.args, self.task.args_size);
        }
    }
}

/// Creates an engine with default settings. Worker threads start on first use or on
/// [`steal_scheduler_init`].
#[unsafe(no_mangle)]
pub extern "C" fn steal_engine_create() -> *mut Engine {
    Box::into_raw(Box::new(Engine::new()))
}

/// Shuts down and frees an engine.
///
/// # Safety
///
/// `engine` must be null or a pointer returned by [`steal_engine_create`] that has not been
/// freed yet. No other thread may use the engine during or after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn steal_engine_free(engine: *mut Engine) {
    if engine.is_null() {
        return;
    }

    // SAFETY: Forwarding the caller's guarantee.
    drop(unsafe { Box::from_raw(engine) });
}

/// Starts the engine's worker threads. `thread_count <= 0` means one worker per hardware thread.
///
/// Idempotent: only the first call has any effect.
///
/// # Safety
///
/// `engine` must be null or a live pointer returned by [`steal_engine_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn steal_scheduler_init(engine: *const Engine, thread_count: i32) -> i32 {
    // SAFETY: Forwarding the caller's guarantee.
    let Some(engine) = (unsafe { engine.as_ref() }) else {
        return STEAL_ERR_INVALID_ARGUMENT;
    };

    let worker_count = usize::try_from(thread_count).unwrap_or(0);

    match engine.init(worker_count) {
        Ok(()) => STEAL_OK,
        Err(e) => {
            warn!(error = %e, "cannot initialize scheduler");
            status(&e)
        }
    }
}

/// Stops accepting work and waits for all accepted work to finish.
///
/// # Safety
///
/// `engine` must be null or a live pointer returned by [`steal_engine_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn steal_scheduler_shutdown(engine: *const Engine) {
    // SAFETY: Forwarding the caller's guarantee.
    if let Some(engine) = unsafe { engine.as_ref() } {
        engine.shutdown();
    }
}

/// Creates a future whose result is `size` bytes. Free it with [`steal_future_free`].
#[unsafe(no_mangle)]
pub extern "C" fn steal_future_create(size: usize) -> *const ByteFuture {
    Arc::into_raw(Arc::new(ByteFuture::new(size)))
}

/// Copies the future's size in bytes from `value` into the future and wakes all waiters.
///
/// # Safety
///
/// `future` must be null or a live pointer returned by [`steal_future_create`]. `value` must
/// point to at least as many readable bytes as the future's size (it may be null if that size
/// is zero).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn steal_future_set(future: *const ByteFuture, value: *const u8) {
    // SAFETY: Forwarding the caller's guarantee.
    let Some(future) = (unsafe { future.as_ref() }) else {
        return;
    };

    if future.size() == 0 {
        future.set(&[]);
        return;
    }

    if value.is_null() {
        error!("future result pointer is null");
        future.fail(TaskError::Failed("result pointer was null".to_string()));
        return;
    }

    // SAFETY: The caller guarantees `value` points to `size` readable bytes.
    let bytes = unsafe { slice::from_raw_parts(value, future.size()) };
    future.set(bytes);
}

/// Blocks until the future is complete and returns a pointer to its result bytes.
///
/// Returns null if the future is null or the task that should have produced the result failed.
/// The pointer stays valid until the future is freed.
///
/// # Safety
///
/// `future` must be null or a live pointer returned by [`steal_future_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn steal_future_get(future: *const ByteFuture) -> *const u8 {
    // SAFETY: Forwarding the caller's guarantee.
    let Some(future) = (unsafe { future.as_ref() }) else {
        return ptr::null();
    };

    match future.get() {
        Ok(bytes) => bytes.as_ptr(),
        Err(e) => {
            warn!(error = %e, "future holds no result");
            ptr::null()
        }
    }
}

/// Releases the caller's reference to a future.
///
/// # Safety
///
/// `future` must be null or a pointer returned by [`steal_future_create`] that the caller has
/// not freed yet. Pointers obtained from [`steal_future_get`] are invalid afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn steal_future_free(future: *const ByteFuture) {
    if future.is_null() {
        return;
    }

    // SAFETY: Forwarding the caller's guarantee.
    drop(unsafe { Arc::from_raw(future) });
}

/// Allocates a zeroed argument block of `size` bytes, aligned for any scalar.
///
/// Returns null if `size` is zero or the memory cannot be allocated.
#[unsafe(no_mangle)]
pub extern "C" fn steal_args_alloc(size: usize) -> *mut u8 {
    let Some(layout) = args_layout(size) else {
        return ptr::null_mut();
    };

    // SAFETY: The layout has a non-zero size.
    unsafe { alloc::alloc_zeroed(layout) }
}

/// Frees an argument block that was never handed to [`steal_spawn_schedule`].
///
/// # Safety
///
/// `args` must be null or a pointer returned by [`steal_args_alloc`] with the same `size`, not
/// freed yet and not owned by a scheduled task.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn steal_args_free(args: *mut u8, size: usize) {
    if args.is_null() {
        return;
    }

    let Some(layout) = args_layout(size) else {
        return;
    };

    // SAFETY: Forwarding the caller's guarantee; the layout matches the allocation.
    unsafe {
        alloc::dealloc(args, layout);
    }
}

fn args_layout(size: usize) -> Option<Layout> {
    if size == 0 {
        return None;
    }

    Layout::from_size_align(size, ARGS_ALIGN).ok()
}

/// Schedules a spawned function on the engine's spawn pool.
///
/// On success and on failure alike, the engine takes ownership of the argument block. If the
/// task cannot be scheduled, its future (if any) completes as failed.
///
/// # Safety
///
/// * `engine` must be null or a live pointer returned by [`steal_engine_create`].
/// * `task.args` must be null or an unfreed block from [`steal_args_alloc`] of `task.args_size`
///   bytes.
/// * `task.future` must be null or a live pointer returned by [`steal_future_create`].
/// * `task.function` and `task.completion` must be safe to call from any thread with the
///   pointers in `task`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn steal_spawn_schedule(engine: *const Engine, task: RawSpawnTask) -> i32 {
    // SAFETY: Forwarding the caller's guarantee.
    let adapter = unsafe { RawTaskAdapter::new(task) };

    // SAFETY: Forwarding the caller's guarantee.
    let Some(engine) = (unsafe { engine.as_ref() }) else {
        return STEAL_ERR_INVALID_ARGUMENT;
    };

    let invocation = SpawnInvocation::new(Box::new(adapter));

    match engine.scheduler().spawn_invocation(invocation) {
        Ok(()) => STEAL_OK,
        Err(e) => {
            warn!(error = %e, "cannot schedule spawned function");
            status(&e)
        }
    }
}
