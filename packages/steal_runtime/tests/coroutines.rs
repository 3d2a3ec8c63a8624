//! Integration tests for lazy frame promotion and resumption of suspended call chains.
//!
//! Ignored under Miri because the engine runs real worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use steal_runtime::{
    Engine, FrameAllocError, FrameAllocator, FrameContext, FrameHandle, FrameState,
    HeapFrameAllocator, RampResult, RuntimeError, Scheduler, StackFrame, TaskError, WorkerId,
};
use testing::{wait_until, with_watchdog};

/// Counts allocations and releases before delegating to the heap.
#[derive(Debug, Default)]
struct CountingAllocator {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl FrameAllocator for CountingAllocator {
    fn allocate(&self, size: usize) -> Result<Box<[u8]>, FrameAllocError> {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        HeapFrameAllocator::new().allocate(size)
    }

    fn release(&self, storage: Box<[u8]>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        drop(storage);
    }
}

/// Appends the frame's depth (its only local) to the output of the frame it awaited.
fn append_depth(frame: &mut FrameContext) -> RampResult<Vec<u8>> {
    let mut output = frame.take_awaited().unwrap_or_default();
    output.extend_from_slice(frame.locals());
    RampResult::Complete(output)
}

/// Reports which worker resumed the frame.
fn report_worker(frame: &mut FrameContext) -> RampResult<Vec<u8>> {
    let index = u8::try_from(frame.worker().index()).unwrap();
    RampResult::Complete(vec![index])
}

/// Marks that the frame finished, after whatever it awaited.
fn append_marker(frame: &mut FrameContext) -> RampResult<Vec<u8>> {
    let mut output = frame.take_awaited().unwrap_or_default();
    output.push(99);
    RampResult::Complete(output)
}

/// Calls a coroutine that suspends on a leaf completed by a spawned task, then awaits it.
fn call_nested_coroutine(frame: &mut FrameContext) -> RampResult<Vec<u8>> {
    let scheduler = frame.scheduler().unwrap().clone();
    let leaf = scheduler.new_leaf_frame().unwrap();

    // The nested coroutine runs on this stack until it awaits the leaf, then gets promoted.
    let nested = scheduler
        .await_result::<Vec<u8>>(
            RampResult::Pending(leaf),
            StackFrame::new(&[10], append_depth),
        )
        .unwrap();
    assert!(!nested.is_complete());

    let completer = scheduler.clone();
    scheduler
        .spawn_and_forget(move || completer.complete_frame(leaf, vec![5]).unwrap())
        .unwrap();

    frame.await_result(nested, append_marker)
}

fn unreachable_resume(_frame: &mut FrameContext) -> RampResult<Vec<u8>> {
    panic!("a frame whose dependency failed must not be resumed");
}

/// Builds a chain of `depth` promoted frames on top of `leaf`, innermost first.
fn build_chain(scheduler: &Scheduler, leaf: FrameHandle, depth: u8) -> Vec<FrameHandle> {
    let mut chain = Vec::new();
    let mut awaited = leaf;

    for level in 1..=depth {
        let locals = [level];
        let result = scheduler
            .await_result::<Vec<u8>>(
                RampResult::Pending(awaited),
                StackFrame::new(&locals, append_depth),
            )
            .unwrap();

        awaited = result.pending_frame().unwrap();
        chain.push(awaited);
    }

    chain
}

#[cfg_attr(miri, ignore)]
#[test]
fn suspended_chain_resumes_from_the_inside_out() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(3).build();
        let scheduler = engine.scheduler();

        let leaf = scheduler.new_leaf_frame().unwrap();
        let chain = build_chain(&scheduler, leaf, 5);

        // Every frame waits on the one below it and is waited on by the one above it.
        let mut below = leaf;
        for (position, &frame) in chain.iter().enumerate() {
            let info = scheduler.frame_info(frame).unwrap();
            assert_eq!(info.state(), FrameState::Suspended);
            assert_eq!(info.waiting_on(), Some(below));
            assert_eq!(info.locals_len(), 1);

            let expected_waiters = usize::from(position + 1 < chain.len());
            assert_eq!(info.waiter_count(), expected_waiters);

            below = frame;
        }

        let outermost = *chain.last().unwrap();
        let output = scheduler.observe_frame(outermost).unwrap();

        scheduler.complete_frame(leaf, vec![0]).unwrap();

        assert_eq!(output.get().unwrap(), &vec![0, 1, 2, 3, 4, 5]);
        assert!(wait_until(Duration::from_secs(5), || {
            scheduler.live_frames() == 0
        }));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn synchronous_completion_never_allocates() {
    with_watchdog(|| {
        let allocator = Arc::new(CountingAllocator::default());
        let engine = Engine::builder()
            .worker_count(2)
            .frame_allocator(Arc::clone(&allocator) as Arc<dyn FrameAllocator>)
            .build();
        let scheduler = engine.scheduler();

        for value in 0..100_u32 {
            let locals = value.to_le_bytes();
            let result = scheduler
                .await_result(
                    RampResult::Complete(value),
                    StackFrame::new(&locals, append_depth),
                )
                .unwrap();

            assert_eq!(result, RampResult::Complete(value));
        }

        assert_eq!(allocator.allocated.load(Ordering::Relaxed), 0);
        assert_eq!(scheduler.live_frames(), 0);
        assert!(!engine.is_initialized());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn awaiting_the_same_complete_result_twice_yields_the_same_value() {
    with_watchdog(|| {
        let allocator = Arc::new(CountingAllocator::default());
        let engine = Engine::builder()
            .worker_count(2)
            .frame_allocator(Arc::clone(&allocator) as Arc<dyn FrameAllocator>)
            .build();
        let scheduler = engine.scheduler();

        let complete = RampResult::Complete(vec![3_u8, 1, 4]);
        let locals = [9_u8];

        let first = scheduler
            .await_result(complete.clone(), StackFrame::new(&locals, append_depth))
            .unwrap();
        let second = scheduler
            .await_result(complete.clone(), StackFrame::new(&locals, append_depth))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, complete);
        assert_eq!(allocator.allocated.load(Ordering::Relaxed), 0);
        assert_eq!(scheduler.live_frames(), 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn each_suspension_promotes_one_frame_and_releases_it_once() {
    with_watchdog(|| {
        let allocator = Arc::new(CountingAllocator::default());
        let engine = Engine::builder()
            .worker_count(2)
            .frame_allocator(Arc::clone(&allocator) as Arc<dyn FrameAllocator>)
            .build();
        let scheduler = engine.scheduler();

        let leaf = scheduler.new_leaf_frame().unwrap();
        let chain = build_chain(&scheduler, leaf, 3);
        assert_eq!(allocator.allocated.load(Ordering::Relaxed), 3);

        let output = scheduler.observe_frame(*chain.last().unwrap()).unwrap();
        scheduler.complete_frame(leaf, Vec::new()).unwrap();
        assert_eq!(output.get().unwrap(), &vec![1, 2, 3]);

        assert!(wait_until(Duration::from_secs(5), || {
            allocator.released.load(Ordering::Relaxed) == 3
        }));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn failure_propagates_up_the_chain_without_resuming() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(2).build();
        let scheduler = engine.scheduler();

        let leaf = scheduler.new_leaf_frame().unwrap();

        let mut awaited = leaf;
        for _ in 0..3 {
            awaited = scheduler
                .await_result::<Vec<u8>>(
                    RampResult::Pending(awaited),
                    StackFrame::new(&[], unreachable_resume),
                )
                .unwrap()
                .pending_frame()
                .unwrap();
        }

        let output = scheduler.observe_frame(awaited).unwrap();
        scheduler.fail_frame(leaf, "socket closed").unwrap();

        assert_eq!(output.get().unwrap_err(), TaskError::DependencyFailed);
        assert_eq!(scheduler.live_frames(), 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn awaiting_an_already_completed_frame_resumes_immediately() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(2).build();
        let scheduler = engine.scheduler();

        let leaf = scheduler.new_leaf_frame().unwrap();
        scheduler.complete_frame(leaf, vec![7]).unwrap();

        // Nobody was waiting, so the leaf keeps its output until someone links to it.
        assert_eq!(
            scheduler.frame_info(leaf).unwrap().state(),
            FrameState::Complete
        );

        let chain = build_chain(&scheduler, leaf, 1);
        let output = scheduler.observe_frame(chain[0]).unwrap();

        assert_eq!(output.get().unwrap(), &vec![7, 1]);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn resumed_frame_promotes_and_awaits_a_nested_coroutine() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(2).build();
        let scheduler = engine.scheduler();

        let leaf = scheduler.new_leaf_frame().unwrap();
        let outer = scheduler
            .await_result::<Vec<u8>>(
                RampResult::Pending(leaf),
                StackFrame::new(&[], call_nested_coroutine),
            )
            .unwrap()
            .pending_frame()
            .unwrap();

        let output = scheduler.observe_frame(outer).unwrap();
        scheduler.complete_frame(leaf, Vec::new()).unwrap();

        // Nested leaf output, then the nested frame's local, then the outer frame's marker.
        assert_eq!(output.get().unwrap(), &vec![5, 10, 99]);
        assert!(wait_until(Duration::from_secs(5), || {
            scheduler.live_frames() == 0
        }));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn pinned_frame_resumes_on_its_worker() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(3).build();
        let scheduler = engine.scheduler();

        for _ in 0..20 {
            let leaf = scheduler.new_leaf_frame().unwrap();
            let frame = scheduler
                .await_result::<Vec<u8>>(
                    RampResult::Pending(leaf),
                    StackFrame::new(&[], report_worker).pinned_to(WorkerId::new(2)),
                )
                .unwrap()
                .pending_frame()
                .unwrap();

            assert_eq!(
                scheduler.frame_info(frame).unwrap().affinity(),
                Some(WorkerId::new(2))
            );

            let output = scheduler.observe_frame(frame).unwrap();
            scheduler.complete_frame(leaf, Vec::new()).unwrap();

            assert_eq!(output.get().unwrap(), &vec![2]);
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shutdown_abandons_frames_that_can_never_resume() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(2).build();
        let scheduler = engine.scheduler();

        let leaf = scheduler.new_leaf_frame().unwrap();
        let chain = build_chain(&scheduler, leaf, 2);
        let output = scheduler.observe_frame(chain[1]).unwrap();

        engine.shutdown();

        assert_eq!(output.get().unwrap_err(), TaskError::Abandoned);
        assert!(matches!(
            scheduler.complete_frame(leaf, Vec::new()),
            Err(RuntimeError::ShutDown)
        ));
        assert_eq!(scheduler.live_frames(), 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn frame_completed_from_outside_during_shutdown_finishes_the_drain() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(2).build();
        let scheduler = engine.scheduler();

        let leaf = scheduler.new_leaf_frame().unwrap();
        let chain = build_chain(&scheduler, leaf, 1);
        let observed = scheduler.observe_frame(chain[0]).unwrap();

        // In flight for the whole drain, until the leaf completes.
        let waiter = scheduler.spawn(move || observed.get().cloned()).unwrap();

        let completer = {
            let scheduler = scheduler.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                scheduler.complete_frame(leaf, vec![7])
            })
        };

        engine.shutdown();

        assert!(completer.join().unwrap().is_ok());
        assert_eq!(*waiter.get().unwrap(), Ok(vec![7, 1]));
        assert!(matches!(
            scheduler.complete_frame(leaf, Vec::new()),
            Err(RuntimeError::ShutDown)
        ));
    });
}
