//! Metrics for the execution engine.
//!
//! Events are per-thread instances, so recording them never contends between workers.

use nm::{Event, Magnitude};

/// Histogram buckets for scheduling delay in milliseconds.
///
/// The scheduling delay is the time between when a task is spawned and when it starts executing.
const SCHEDULING_DELAY_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 50, 100, 200, 500, 1000];

/// Histogram buckets for work item execution time in milliseconds.
const EXECUTION_TIME_MS_BUCKETS: &[Magnitude] = &[0, 1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000];

/// Histogram buckets for the size of promoted coroutine frame payloads in bytes.
const PROMOTED_FRAME_BYTES_BUCKETS: &[Magnitude] = &[0, 16, 64, 256, 1024, 4096, 16384, 65536];

thread_local! {
    /// Work items executed by a worker, in either pool.
    pub(crate) static ITEMS_EXECUTED: Event = Event::builder()
        .name("steal_runtime_items_executed")
        .build();

    /// Work items a worker took from another worker's queue.
    pub(crate) static ITEMS_STOLEN: Event = Event::builder()
        .name("steal_runtime_items_stolen")
        .build();

    /// The delay between a spawn call and the task starting to execute.
    ///
    /// The magnitude is the delay in milliseconds.
    pub(crate) static SCHEDULING_DELAY_MS: Event = Event::builder()
        .name("steal_runtime_scheduling_delay_ms")
        .histogram(SCHEDULING_DELAY_MS_BUCKETS)
        .build();

    /// The time a work item spends executing.
    ///
    /// The magnitude is the execution time in milliseconds.
    pub(crate) static EXECUTION_TIME_MS: Event = Event::builder()
        .name("steal_runtime_execution_time_ms")
        .histogram(EXECUTION_TIME_MS_BUCKETS)
        .build();

    /// Awaits that found the result already complete and needed no frame.
    pub(crate) static FAST_PATH_AWAITS: Event = Event::builder()
        .name("steal_runtime_fast_path_awaits")
        .build();

    /// Stack frames promoted to the frame table.
    ///
    /// The magnitude is the size of the captured locals in bytes.
    pub(crate) static FRAMES_PROMOTED: Event = Event::builder()
        .name("steal_runtime_frames_promoted")
        .histogram(PROMOTED_FRAME_BYTES_BUCKETS)
        .build();

    /// Frames that completed with an error, including dependents of failed frames.
    pub(crate) static FRAMES_FAILED: Event = Event::builder()
        .name("steal_runtime_frames_failed")
        .build();
}
