//! Storage for promoted coroutine frames.
//!
//! Frames only need storage once a coroutine actually suspends. The engine asks a
//! [`FrameAllocator`] for it at promotion and hands it back when the frame is removed, so hosts
//! can plug in their own arena or pool.

use std::fmt::Debug;

use thiserror::Error;

/// Supplies the storage for promoted coroutine frame payloads.
///
/// This is the seam to the host's memory manager. A garbage-collected host routes promoted frames
/// through its own nursery; the default [`HeapFrameAllocator`] uses the Rust global allocator.
///
/// Storage is returned to the allocator through [`release()`][Self::release] once the frame has
/// been resumed for the last time.
pub trait FrameAllocator: Send + Sync + Debug + 'static {
    /// Allocates a zero-initialized buffer of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameAllocError`] if the storage cannot be provided. The frame is then not
    /// promoted and the caller receives [`RuntimeError::FrameAllocation`][crate::RuntimeError].
    fn allocate(&self, size: usize) -> Result<Box<[u8]>, FrameAllocError>;

    /// Takes back a buffer previously returned by [`allocate()`][Self::allocate].
    fn release(&self, storage: Box<[u8]>) {
        drop(storage);
    }
}

/// A [`FrameAllocator`] could not provide storage.
#[derive(Debug, Error)]
#[error("cannot allocate {size} bytes of frame storage")]
#[non_exhaustive]
pub struct FrameAllocError {
    /// The number of bytes requested.
    pub size: usize,
}

impl FrameAllocError {
    /// Creates an error for a failed request of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

/// Allocates frame storage from the Rust global allocator, reporting exhaustion as an error
/// instead of aborting.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct HeapFrameAllocator;

impl HeapFrameAllocator {
    /// Creates the allocator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FrameAllocator for HeapFrameAllocator {
    fn allocate(&self, size: usize) -> Result<Box<[u8]>, FrameAllocError> {
        let mut storage = Vec::new();
        if storage.try_reserve_exact(size).is_err() {
            return Err(FrameAllocError::new(size));
        }
        storage.resize(size, 0);

        Ok(storage.into_boxed_slice())
    }
}
