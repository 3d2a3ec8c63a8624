//! Promoted coroutine frames and the table that owns them.
//!
//! A frame exists in the table only once its coroutine has actually suspended: stack frames
//! that never hit a pending await are never materialized here. Each frame stores the forward
//! `waiting_on` link to the frame it is blocked on, and the table materializes the reverse
//! direction as a waiter list on the callee, so that completing a frame can locate and wake
//! everything that waits on it.

use std::any::type_name;
use std::fmt;
use std::mem;
use std::sync::Arc;

use derive_more::Display;
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, error, trace};

use crate::metrics::{FRAMES_FAILED, FRAMES_PROMOTED};
use crate::{
    CoroutineResumption, FrameAllocator, Future, ResumePoint, RuntimeError, TaskError, WorkerId,
};

/// Identifies a promoted coroutine frame.
///
/// Handles stay cheap to copy and never dangle: once a frame has been removed from the table,
/// its handle is rejected even if the slot has since been reused by another frame.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("{index}:{generation}")]
pub struct FrameHandle {
    index: usize,
    generation: u64,
}

/// Lifecycle of a promoted frame.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum FrameState {
    /// The frame's resume point is executing on a worker.
    Running,

    /// The frame is waiting for the frame it depends on, or for a worker to resume it.
    Suspended,

    /// The frame has produced its output (or failed) and will not run again.
    Complete,
}

/// A snapshot of a frame's bookkeeping, for diagnostics and tests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameInfo {
    state: FrameState,
    waiting_on: Option<FrameHandle>,
    waiter_count: usize,
    locals_len: usize,
    affinity: Option<WorkerId>,
}

impl FrameInfo {
    /// The lifecycle state of the frame.
    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// The frame this frame is blocked on, if any.
    #[must_use]
    pub fn waiting_on(&self) -> Option<FrameHandle> {
        self.waiting_on
    }

    /// How many frames and observers wait for this frame to complete.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiter_count
    }

    /// Size of the locals captured when the frame was promoted.
    #[must_use]
    pub fn locals_len(&self) -> usize {
        self.locals_len
    }

    /// The worker the frame is pinned to, if any.
    #[must_use]
    pub fn affinity(&self) -> Option<WorkerId> {
        self.affinity
    }
}

/// The result slot handed out to observers of a frame.
pub(crate) type FrameFuture = Future<Vec<u8>>;

type FrameOutcome = Result<Vec<u8>, TaskError>;

enum Waiter {
    Frame(FrameHandle),
    Observer(Arc<FrameFuture>),
}

struct CoroutineFrame {
    generation: u64,
    state: FrameState,

    // `None` for leaf frames, which are completed by an external event instead of resumed.
    resume_point: Option<ResumePoint>,

    // Moved out while the resume point runs, moved back in when it suspends again.
    locals: Option<Box<[u8]>>,
    locals_len: usize,

    waiting_on: Option<FrameHandle>,
    waiters: Vec<Waiter>,
    affinity: Option<WorkerId>,

    // Output of the completed dependency, waiting to be picked up by the next resumption.
    awaited: Option<Vec<u8>>,

    // Kept when the frame completes before anyone waits on it.
    outcome: Option<FrameOutcome>,
}

impl CoroutineFrame {
    fn info(&self) -> FrameInfo {
        FrameInfo {
            state: self.state,
            waiting_on: self.waiting_on,
            waiter_count: self.waiters.len(),
            locals_len: self.locals_len,
            affinity: self.affinity,
        }
    }
}

/// What a resumption needs to run a frame's resume point.
pub(crate) struct ResumeState {
    pub(crate) locals: Box<[u8]>,
    pub(crate) resume_point: ResumePoint,
    pub(crate) awaited: Option<Vec<u8>>,
}

/// How a resume point invocation ended.
pub(crate) enum ResumeOutcome {
    Completed(Vec<u8>),
    Awaiting {
        callee: FrameHandle,
        resume_point: ResumePoint,
    },
    Failed(TaskError),
}

/// Work decided under the table lock but performed after releasing it.
#[derive(Default)]
struct Effects {
    runnable: Vec<CoroutineResumption>,
    observers: Vec<(Arc<FrameFuture>, FrameOutcome)>,
    released: Vec<Box<[u8]>>,
}

#[derive(Default)]
struct FrameArena {
    frames: Slab<CoroutineFrame>,
    next_generation: u64,
}

impl FrameArena {
    fn get(&self, handle: FrameHandle) -> Option<&CoroutineFrame> {
        self.frames
            .get(handle.index)
            .filter(|frame| frame.generation == handle.generation)
    }

    fn get_mut(&mut self, handle: FrameHandle) -> Option<&mut CoroutineFrame> {
        self.frames
            .get_mut(handle.index)
            .filter(|frame| frame.generation == handle.generation)
    }

    fn remove(&mut self, handle: FrameHandle) -> Option<CoroutineFrame> {
        self.get(handle)?;
        Some(self.frames.remove(handle.index))
    }

    fn insert(
        &mut self,
        resume_point: Option<ResumePoint>,
        locals: Option<Box<[u8]>>,
        affinity: Option<WorkerId>,
    ) -> FrameHandle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let index = self.frames.insert(CoroutineFrame {
            generation,
            state: FrameState::Suspended,
            resume_point,
            locals_len: locals.as_ref().map_or(0, |locals| locals.len()),
            locals,
            waiting_on: None,
            waiters: Vec::new(),
            affinity,
            awaited: None,
            outcome: None,
        });

        FrameHandle { index, generation }
    }

    /// Makes `frame` wait for `callee`. If `callee` already completed, its outcome is delivered
    /// right away.
    fn link(
        &mut self,
        table: &Arc<FrameTable>,
        frame: FrameHandle,
        callee: FrameHandle,
        effects: &mut Effects,
    ) {
        if let Some(waiting) = self.get_mut(frame) {
            waiting.waiting_on = Some(callee);
        }

        let callee_state = self.get(callee).map(|callee| callee.state);

        match callee_state {
            Some(FrameState::Complete) => {
                let outcome = self
                    .remove(callee)
                    .and_then(|callee| callee.outcome)
                    .unwrap_or(Err(TaskError::DependencyFailed));

                match outcome {
                    Ok(output) => self.deliver(table, frame, output, effects),
                    Err(_) => self.resolve(table, frame, Err(TaskError::DependencyFailed), effects),
                }
            }
            Some(_) => {
                if let Some(callee) = self.get_mut(callee) {
                    callee.waiters.push(Waiter::Frame(frame));
                }
            }
            None => {
                error!(%frame, %callee, "frame awaits a frame that does not exist");
                self.resolve(table, frame, Err(TaskError::DependencyFailed), effects);
            }
        }
    }

    /// Hands a completed dependency's output to a waiting frame and makes it runnable.
    fn deliver(
        &mut self,
        table: &Arc<FrameTable>,
        handle: FrameHandle,
        output: Vec<u8>,
        effects: &mut Effects,
    ) {
        let Some(frame) = self.get_mut(handle) else {
            return;
        };

        // Resolved from the outside while it was waiting.
        if frame.state != FrameState::Suspended {
            return;
        }

        frame.awaited = Some(output);
        effects.runnable.push(CoroutineResumption::new(
            Arc::clone(table),
            handle,
            frame.affinity,
        ));
    }

    /// Completes a frame and everything that transitively fails along with it.
    fn resolve(
        &mut self,
        table: &Arc<FrameTable>,
        handle: FrameHandle,
        outcome: FrameOutcome,
        effects: &mut Effects,
    ) {
        let mut pending = vec![(handle, outcome)];

        while let Some((handle, outcome)) = pending.pop() {
            let Some(frame) = self.get_mut(handle) else {
                continue;
            };

            if frame.state == FrameState::Complete {
                continue;
            }

            frame.state = FrameState::Complete;
            frame.waiting_on = None;
            frame.resume_point = None;
            frame.awaited = None;
            effects.released.extend(frame.locals.take());

            if let Err(error) = &outcome {
                FRAMES_FAILED.with(nm::Event::observe_once);
                debug!(frame = %handle, %error, "frame failed");
            }

            let waiters = mem::take(&mut frame.waiters);

            if waiters.is_empty() {
                frame.outcome = Some(outcome);
                continue;
            }

            // The outcome is delivered, so nobody can refer to this frame any more.
            self.remove(handle);

            for waiter in waiters {
                match waiter {
                    Waiter::Observer(future) => effects.observers.push((future, outcome.clone())),
                    Waiter::Frame(waiter) => match &outcome {
                        Ok(output) => self.deliver(table, waiter, output.clone(), effects),
                        // Shutdown abandons the whole chain, anything else is a failed dependency.
                        Err(TaskError::Abandoned) => {
                            pending.push((waiter, Err(TaskError::Abandoned)));
                        }
                        Err(_) => pending.push((waiter, Err(TaskError::DependencyFailed))),
                    },
                }
            }
        }
    }
}

/// Owns every promoted coroutine frame of an engine.
///
/// The lock is held only for bookkeeping. Resume points run with the lock released and with the
/// frame's locals moved out of the table, and frame storage is returned to the allocator only
/// after the lock has been released.
pub(crate) struct FrameTable {
    arena: Mutex<FrameArena>,
    allocator: Arc<dyn FrameAllocator>,
}

impl FrameTable {
    pub(crate) fn new(allocator: Arc<dyn FrameAllocator>) -> Self {
        Self {
            arena: Mutex::new(FrameArena::default()),
            allocator,
        }
    }

    /// Promotes a suspended stack frame: copies its locals into frame storage and links the new
    /// frame to the callee it waits on.
    ///
    /// Returns the new frame and any resumptions that became runnable because the callee had
    /// already completed.
    pub(crate) fn promote(
        self: &Arc<Self>,
        locals: &[u8],
        resume_point: ResumePoint,
        affinity: Option<WorkerId>,
        callee: FrameHandle,
    ) -> Result<(FrameHandle, Vec<CoroutineResumption>), RuntimeError> {
        let mut storage = self
            .allocator
            .allocate(locals.len())
            .map_err(|e| RuntimeError::FrameAllocation { size: e.size })?;

        if storage.len() != locals.len() {
            error!(
                requested = locals.len(),
                provided = storage.len(),
                "frame allocator returned storage of the wrong size"
            );
            self.allocator.release(storage);
            return Err(RuntimeError::FrameAllocation { size: locals.len() });
        }

        storage.copy_from_slice(locals);

        let mut effects = Effects::default();

        let frame = {
            let mut arena = self.arena.lock();

            if arena.get(callee).is_none() {
                drop(arena);
                self.allocator.release(storage);
                return Err(RuntimeError::UnknownFrame(callee));
            }

            let frame = arena.insert(Some(resume_point), Some(storage), affinity);
            arena.link(self, frame, callee, &mut effects);
            frame
        };

        FRAMES_PROMOTED.with(|event| event.observe(locals.len()));
        trace!(%frame, %callee, locals_len = locals.len(), "promoted frame");

        Ok((frame, self.settle(effects)))
    }

    /// Creates a suspended frame that has no resume point and is completed by an external event.
    pub(crate) fn new_leaf(&self) -> FrameHandle {
        self.arena.lock().insert(None, None, None)
    }

    /// Moves a suspended frame to the running state and hands out what its resume point needs.
    ///
    /// Returns `None` if the frame no longer needs resuming (it was resolved from the outside
    /// while the resumption was queued).
    pub(crate) fn begin_resume(&self, handle: FrameHandle) -> Option<ResumeState> {
        let mut arena = self.arena.lock();

        let Some(frame) = arena.get_mut(handle) else {
            debug!(frame = %handle, "resumption found no frame");
            return None;
        };

        if frame.state != FrameState::Suspended {
            debug!(frame = %handle, state = %frame.state, "resumption found frame not suspended");
            return None;
        }

        let resume_point = frame.resume_point?;
        let locals = frame.locals.take().unwrap_or_default();

        frame.state = FrameState::Running;
        frame.waiting_on = None;

        Some(ResumeState {
            locals,
            resume_point,
            awaited: frame.awaited.take(),
        })
    }

    /// Takes a frame back after its resume point returned.
    pub(crate) fn finish_resume(
        self: &Arc<Self>,
        handle: FrameHandle,
        locals: Box<[u8]>,
        outcome: ResumeOutcome,
    ) -> Vec<CoroutineResumption> {
        let mut effects = Effects::default();

        {
            let mut arena = self.arena.lock();

            // Resolved from the outside while running, e.g. abandoned by a shutdown.
            let Some(frame) = arena
                .get_mut(handle)
                .filter(|frame| frame.state == FrameState::Running)
            else {
                debug!(frame = %handle, "frame was resolved while its resume point was running");
                drop(arena);
                self.allocator.release(locals);
                return Vec::new();
            };

            match outcome {
                ResumeOutcome::Completed(output) => {
                    effects.released.push(locals);
                    arena.resolve(self, handle, Ok(output), &mut effects);
                }
                ResumeOutcome::Failed(error) => {
                    effects.released.push(locals);
                    arena.resolve(self, handle, Err(error), &mut effects);
                }
                ResumeOutcome::Awaiting {
                    callee,
                    resume_point,
                } => {
                    frame.locals = Some(locals);
                    frame.resume_point = Some(resume_point);
                    frame.state = FrameState::Suspended;

                    if callee == handle {
                        error!(frame = %handle, "frame awaits itself");
                        arena.resolve(self, handle, Err(TaskError::DependencyFailed), &mut effects);
                    } else {
                        arena.link(self, handle, callee, &mut effects);
                    }
                }
            }
        }

        self.settle(effects)
    }

    /// Completes a suspended frame from the outside (typically a leaf frame).
    pub(crate) fn complete(
        self: &Arc<Self>,
        handle: FrameHandle,
        outcome: Result<Vec<u8>, TaskError>,
    ) -> Result<Vec<CoroutineResumption>, RuntimeError> {
        let mut effects = Effects::default();

        {
            let mut arena = self.arena.lock();

            let state = arena
                .get(handle)
                .map(|frame| frame.state)
                .ok_or(RuntimeError::UnknownFrame(handle))?;

            match state {
                FrameState::Suspended => arena.resolve(self, handle, outcome, &mut effects),
                FrameState::Running => return Err(RuntimeError::FrameRunning(handle)),
                FrameState::Complete => return Err(RuntimeError::FrameAlreadyComplete(handle)),
            }
        }

        Ok(self.settle(effects))
    }

    /// Fails a frame whose resumption was dropped without executing.
    pub(crate) fn abandon(self: &Arc<Self>, handle: FrameHandle) {
        let mut effects = Effects::default();

        self.arena
            .lock()
            .resolve(self, handle, Err(TaskError::Abandoned), &mut effects);

        let runnable = self.settle(effects);
        debug_assert!(runnable.is_empty(), "failures never make frames runnable");
    }

    /// Fails every frame that has not completed yet. Used when the engine shuts down.
    pub(crate) fn abandon_all(self: &Arc<Self>) {
        let mut effects = Effects::default();

        {
            let mut arena = self.arena.lock();

            let incomplete = arena
                .frames
                .iter()
                .filter(|(_, frame)| frame.state != FrameState::Complete)
                .map(|(index, frame)| FrameHandle {
                    index,
                    generation: frame.generation,
                })
                .collect::<Vec<_>>();

            if !incomplete.is_empty() {
                debug!(count = incomplete.len(), "abandoning incomplete frames");
            }

            for handle in incomplete {
                arena.resolve(self, handle, Err(TaskError::Abandoned), &mut effects);
            }
        }

        let runnable = self.settle(effects);
        debug_assert!(runnable.is_empty(), "failures never make frames runnable");
    }

    /// Returns a future that receives the frame's outcome.
    pub(crate) fn observe(&self, handle: FrameHandle) -> Result<Arc<FrameFuture>, RuntimeError> {
        let mut arena = self.arena.lock();

        let frame = arena
            .get_mut(handle)
            .ok_or(RuntimeError::UnknownFrame(handle))?;

        let future = Arc::new(FrameFuture::new());

        if frame.state == FrameState::Complete {
            let outcome = frame
                .outcome
                .take()
                .unwrap_or(Err(TaskError::DependencyFailed));
            arena.remove(handle);
            drop(arena);

            set_outcome(&future, outcome);
        } else {
            frame.waiters.push(Waiter::Observer(Arc::clone(&future)));
        }

        Ok(future)
    }

    /// Removes a completed frame whose outcome nobody is going to consume.
    pub(crate) fn release(&self, handle: FrameHandle) -> Result<(), RuntimeError> {
        let mut arena = self.arena.lock();

        let state = arena
            .get(handle)
            .map(|frame| frame.state)
            .ok_or(RuntimeError::UnknownFrame(handle))?;

        if state != FrameState::Complete {
            return Err(RuntimeError::FrameNotComplete(handle));
        }

        arena.remove(handle);
        Ok(())
    }

    pub(crate) fn info(&self, handle: FrameHandle) -> Option<FrameInfo> {
        self.arena.lock().get(handle).map(CoroutineFrame::info)
    }

    pub(crate) fn live_frames(&self) -> usize {
        self.arena.lock().frames.len()
    }

    fn settle(&self, effects: Effects) -> Vec<CoroutineResumption> {
        let Effects {
            runnable,
            observers,
            released,
        } = effects;

        for storage in released {
            self.allocator.release(storage);
        }

        for (future, outcome) in observers {
            set_outcome(&future, outcome);
        }

        runnable
    }
}

fn set_outcome(future: &FrameFuture, outcome: FrameOutcome) {
    // Every observer future is created here and resolved exactly once.
    if future.set(outcome).is_err() {
        error!("frame observer was already resolved");
    }
}

impl Drop for FrameTable {
    fn drop(&mut self) {
        let arena = mem::take(self.arena.get_mut());

        for (_, frame) in arena.frames {
            if let Some(locals) = frame.locals {
                self.allocator.release(locals);
            }

            for waiter in frame.waiters {
                if let Waiter::Observer(future) = waiter {
                    set_outcome(&future, Err(TaskError::Abandoned));
                }
            }
        }
    }
}

impl fmt::Debug for FrameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("live_frames", &self.live_frames())
            .field("allocator", &self.allocator)
            .finish()
    }
}
