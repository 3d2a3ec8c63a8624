//! Spawns a fan-out of tasks, suspends a short chain of coroutines on an external event and
//! prints the engine's metrics once everything has drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nm::Report;
use steal_runtime::{Engine, FrameContext, RampResult, StackFrame};

/// Doubles the value produced by the awaited frame.
fn double(frame: &mut FrameContext) -> RampResult<Vec<u8>> {
    let awaited = frame.take_awaited().unwrap_or_default();
    let value = u64::from_le_bytes(awaited.try_into().unwrap_or_default());

    RampResult::Complete(value.wrapping_mul(2).to_le_bytes().to_vec())
}

fn main() {
    let engine = Engine::builder().worker_count(4).build();
    let scheduler = engine.scheduler();

    let total = Arc::new(AtomicU64::new(0));

    println!("Spawning 1000 tasks...");
    let futures = (0..1000_u64)
        .map(|i| {
            let total = Arc::clone(&total);
            scheduler
                .spawn(move || {
                    total.fetch_add(i, Ordering::Relaxed);
                    i * i
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    let squares: u64 = futures.iter().map(|future| *future.get().unwrap()).sum();
    println!("Sum: {}", total.load(Ordering::Relaxed));
    println!("Sum of squares: {squares}");

    println!("Suspending three coroutines on an external event...");
    let event = scheduler.new_leaf_frame().unwrap();

    let mut awaited = event;
    for _ in 0..3 {
        awaited = scheduler
            .await_result::<Vec<u8>>(RampResult::Pending(awaited), StackFrame::new(&[], double))
            .unwrap()
            .pending_frame()
            .unwrap();
    }

    let outermost = scheduler.observe_frame(awaited).unwrap();
    println!("Live frames while suspended: {}", scheduler.live_frames());

    scheduler
        .complete_frame(event, 5_u64.to_le_bytes().to_vec())
        .unwrap();

    let bytes = outermost.get().unwrap().clone();
    let result = u64::from_le_bytes(bytes.try_into().unwrap());
    println!("Coroutine chain produced {result}");
    assert_eq!(result, 40);

    engine.shutdown();

    println!();
    println!("{}", Report::collect());
}
