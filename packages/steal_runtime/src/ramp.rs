//! Lazy stack-to-heap promotion of coroutine frames.
//!
//! A coroutine runs on its caller's native stack until it awaits something that is not ready yet.
//! Only then is its state (the locals the code generator chose to capture) copied into a frame
//! owned by the engine, linked to the frame it waits on, and reported upwards as pending. Each
//! caller that is itself inside an await repeats this, so a suspension promotes exactly one frame
//! per level of the call chain and no frame at all when nothing suspends.

use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tracing::{error, trace, warn};

use crate::engine::EngineShared;
use crate::frame::{FrameTable, ResumeOutcome};
use crate::{FrameHandle, Scheduler, TaskError, WorkItem, WorkerHandle, WorkerId};

/// The result of calling something that may suspend.
#[derive(Clone, Debug, Eq, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "a call either completed or did not, there is no third outcome"
)]
pub enum RampResult<V> {
    /// The call finished synchronously with this value.
    Complete(V),

    /// The call suspended. The handle refers to the frame that will eventually produce the value.
    Pending(FrameHandle),
}

impl<V> RampResult<V> {
    /// Whether the call finished synchronously.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// The pending frame, if the call suspended.
    #[must_use]
    pub fn pending_frame(&self) -> Option<FrameHandle> {
        match self {
            Self::Complete(_) => None,
            Self::Pending(frame) => Some(*frame),
        }
    }
}

/// The entry point a promoted frame is resumed through.
///
/// Resume points are plain function pointers supplied by generated code. They receive the
/// frame's captured locals and the output of the frame it awaited, and either finish with the
/// frame's own output or await again via [`FrameContext::await_result()`].
pub type ResumePoint = fn(&mut FrameContext) -> RampResult<Vec<u8>>;

/// The native stack state of a coroutine at an await point, before promotion.
#[derive(Clone, Copy)]
pub struct StackFrame<'a> {
    locals: &'a [u8],
    resume_point: ResumePoint,
    affinity: Option<WorkerId>,
}

impl<'a> StackFrame<'a> {
    /// Describes a coroutine that captures `locals` and continues at `resume_point`.
    #[must_use]
    pub fn new(locals: &'a [u8], resume_point: ResumePoint) -> Self {
        Self {
            locals,
            resume_point,
            affinity: None,
        }
    }

    /// Pins the frame: if it gets promoted, only `worker` of the coroutine pool resumes it.
    #[must_use]
    pub fn pinned_to(mut self, worker: WorkerId) -> Self {
        self.affinity = Some(worker);
        self
    }

    pub(crate) fn locals(&self) -> &'a [u8] {
        self.locals
    }

    pub(crate) fn resume_point(&self) -> ResumePoint {
        self.resume_point
    }

    pub(crate) fn affinity(&self) -> Option<WorkerId> {
        self.affinity
    }
}

impl fmt::Debug for StackFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("locals_len", &self.locals.len())
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

struct PendingLink {
    callee: FrameHandle,
    resume_point: ResumePoint,
}

/// A promoted frame, as seen by its resume point while it runs.
pub struct FrameContext {
    handle: FrameHandle,
    worker: WorkerId,
    locals: Box<[u8]>,
    awaited: Option<Vec<u8>>,
    link: Option<PendingLink>,
    scheduler: Option<Scheduler>,
}

impl FrameContext {
    /// The frame being resumed.
    #[must_use]
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }

    /// The coroutine pool worker the frame is running on.
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The locals captured at promotion, including changes made by earlier resumptions.
    #[must_use]
    pub fn locals(&self) -> &[u8] {
        &self.locals
    }

    /// Mutable access to the captured locals. Changes persist across suspensions.
    pub fn locals_mut(&mut self) -> &mut [u8] {
        &mut self.locals
    }

    /// The output of the frame this frame was waiting on.
    #[must_use]
    pub fn awaited(&self) -> Option<&[u8]> {
        self.awaited.as_deref()
    }

    /// Takes ownership of the output of the frame this frame was waiting on.
    pub fn take_awaited(&mut self) -> Option<Vec<u8>> {
        self.awaited.take()
    }

    /// The scheduler of the engine resuming this frame.
    ///
    /// Lets the resume point spawn work, create leaf frames and promote the stack frames of
    /// coroutines it calls. `None` only if the engine is already gone.
    #[must_use]
    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    /// Awaits a result from within a frame that is already promoted.
    ///
    /// A complete result is returned unchanged. A pending result suspends this same frame again
    /// (it is never promoted twice): the frame will wait on the pending callee and continue at
    /// `next` once the callee completes. The returned `Pending` refers to this frame and must be
    /// returned from the resume point.
    ///
    /// Only one await may suspend per resumption.
    pub fn await_result<V>(&mut self, result: RampResult<V>, next: ResumePoint) -> RampResult<V> {
        match result {
            RampResult::Complete(value) => RampResult::Complete(value),
            RampResult::Pending(callee) => {
                debug_assert!(
                    self.link.is_none(),
                    "frame {} suspended twice in one resumption",
                    self.handle
                );

                // Applied only after the resume point has returned, so that a fast completion of
                // the callee cannot resume this frame while it is still running.
                self.link = Some(PendingLink {
                    callee,
                    resume_point: next,
                });

                RampResult::Pending(self.handle)
            }
        }
    }
}

impl fmt::Debug for FrameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("handle", &self.handle)
            .field("worker", &self.worker)
            .field("locals_len", &self.locals.len())
            .field("awaited_len", &self.awaited.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Shared by the coroutine pool's workers: the way back to the engine that owns the pool.
///
/// Holds the engine weakly, because the engine owns the pool.
pub struct ResumeContext {
    engine: Weak<EngineShared>,
}

impl ResumeContext {
    pub(crate) fn new(engine: Weak<EngineShared>) -> Self {
        Self { engine }
    }

    fn scheduler(&self) -> Option<Scheduler> {
        self.engine.upgrade().map(Scheduler::from_shared)
    }
}

impl fmt::Debug for ResumeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("engine_alive", &(self.engine.strong_count() > 0))
            .finish()
    }
}

/// A promoted frame that is ready to continue, queued on the coroutine pool.
///
/// Dropping a resumption without executing it (because the engine is shutting down) fails the
/// frame with [`TaskError::Abandoned`].
pub struct CoroutineResumption {
    table: Arc<FrameTable>,
    frame: FrameHandle,
    affinity: Option<WorkerId>,
    executed: bool,
}

impl CoroutineResumption {
    pub(crate) fn new(
        table: Arc<FrameTable>,
        frame: FrameHandle,
        affinity: Option<WorkerId>,
    ) -> Self {
        Self {
            table,
            frame,
            affinity,
            executed: false,
        }
    }

    /// The frame this resumption continues.
    #[must_use]
    pub fn frame(&self) -> FrameHandle {
        self.frame
    }

    fn resume(&self, worker: WorkerId, scheduler: Option<Scheduler>) -> Vec<Self> {
        let Some(state) = self.table.begin_resume(self.frame) else {
            return Vec::new();
        };

        trace!(frame = %self.frame, %worker, "resuming frame");

        let mut context = FrameContext {
            handle: self.frame,
            worker,
            locals: state.locals,
            awaited: state.awaited,
            link: None,
            scheduler,
        };

        let resume_point = state.resume_point;
        let result = panic::catch_unwind(AssertUnwindSafe(|| resume_point(&mut context)));

        let outcome = match result {
            Ok(RampResult::Complete(output)) => {
                if context.link.is_some() {
                    warn!(frame = %self.frame, "frame awaited but then completed, ignoring the await");
                }

                ResumeOutcome::Completed(output)
            }
            Ok(RampResult::Pending(pending)) => match context.link.take() {
                Some(link) if pending == self.frame => ResumeOutcome::Awaiting {
                    callee: link.callee,
                    resume_point: link.resume_point,
                },
                _ => {
                    error!(
                        frame = %self.frame,
                        %pending,
                        "resume point returned a pending result without awaiting it"
                    );
                    ResumeOutcome::Failed(TaskError::Panicked(
                        "resume point returned a pending result without awaiting it".to_string(),
                    ))
                }
            },
            Err(payload) => ResumeOutcome::Failed(TaskError::from_panic(payload.as_ref())),
        };

        self.table.finish_resume(self.frame, context.locals, outcome)
    }
}

impl WorkItem for CoroutineResumption {
    type Context = ResumeContext;

    fn affinity(&self) -> Option<WorkerId> {
        self.affinity
    }

    fn execute(mut self, worker: &WorkerHandle<'_, Self>) {
        self.executed = true;

        let scheduler = worker.context().scheduler();

        for runnable in self.resume(worker.id(), scheduler) {
            if let Err(rejected) = worker.schedule(runnable) {
                // Dropping the rejected resumption fails its frame.
                warn!(reason = %rejected.reason(), "cannot schedule resumption");
            }
        }
    }
}

impl Drop for CoroutineResumption {
    fn drop(&mut self) {
        if !self.executed {
            self.table.abandon(self.frame);
        }
    }
}

impl fmt::Debug for CoroutineResumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("frame", &self.frame)
            .field("affinity", &self.affinity)
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}
