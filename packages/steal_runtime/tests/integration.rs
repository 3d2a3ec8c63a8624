//! Integration tests for spawned work and the generic pool.
//!
//! These tests run real worker threads. They are ignored under Miri because it is too slow for
//! the amount of cross-thread traffic they generate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;

use parking_lot::Mutex;
use steal_runtime::{
    Engine, Future, Pool, RuntimeError, TaskError, WorkItem, WorkerHandle, WorkerId,
};
use testing::with_watchdog;

#[cfg_attr(miri, ignore)]
#[test]
fn every_spawned_task_runs_exactly_once() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(2).build();
        let scheduler = engine.scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            scheduler
                .spawn_and_forget(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }

        engine.shutdown();

        assert_eq!(counter.load(Ordering::Relaxed), 100);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shutdown_waits_for_work_scheduled_by_running_tasks() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(3).build();
        let scheduler = engine.scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            let nested = scheduler.clone();

            scheduler
                .spawn_and_forget(move || {
                    for _ in 0..5 {
                        let counter = Arc::clone(&counter);
                        nested
                            .spawn_and_forget(move || {
                                counter.fetch_add(1, Ordering::Relaxed);
                            })
                            .unwrap();
                    }
                })
                .unwrap();
        }

        drop(engine);

        assert_eq!(counter.load(Ordering::Relaxed), 100);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn results_are_visible_to_the_waiting_thread() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(4).build();
        let scheduler = engine.scheduler();

        let futures = (0..200_u64)
            .map(|i| scheduler.spawn(move || vec![i; 64]).unwrap())
            .collect::<Vec<_>>();

        for (i, future) in (0_u64..).zip(futures) {
            let values = future.get().unwrap();
            assert_eq!(values.len(), 64);
            assert!(values.iter().all(|&value| value == i));
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn panic_in_spawned_task_reaches_the_future() {
    with_watchdog(|| {
        let engine = Engine::builder().worker_count(1).build();
        let scheduler = engine.scheduler();

        let failed = scheduler
            .spawn(|| -> u32 { panic!("task gave up") })
            .unwrap();
        let fine = scheduler.spawn(|| 5_u32).unwrap();

        assert_eq!(
            failed.get().unwrap_err(),
            TaskError::Panicked("task gave up".to_string())
        );
        assert_eq!(*fine.get().unwrap(), 5);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn many_threads_wait_on_one_future() {
    with_watchdog(|| {
        let future = Arc::new(Future::<Vec<u32>>::new());

        let waiters = (0..8)
            .map(|_| {
                let future = Arc::clone(&future);
                thread::spawn(move || future.get().map(|values| values.iter().sum::<u32>()))
            })
            .collect::<Vec<_>>();

        future.set(Ok((1..=100).collect())).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(5050));
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn init_is_idempotent_and_shutdown_is_final() {
    with_watchdog(|| {
        let engine = Engine::new();

        engine.init(2).unwrap();
        engine.init(6).unwrap();
        assert_eq!(engine.worker_count(), Some(2));

        engine.shutdown();
        engine.shutdown();

        assert!(matches!(engine.init(2), Err(RuntimeError::ShutDown)));
        assert!(matches!(
            engine.scheduler().spawn(|| ()),
            Err(RuntimeError::ShutDown)
        ));
    });
}

/// Records the order in which a single worker executes items.
enum Step {
    Gate {
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    },
    Record(u32),
}

impl WorkItem for Step {
    type Context = Mutex<Vec<u32>>;

    fn affinity(&self) -> Option<WorkerId> {
        None
    }

    fn execute(self, worker: &WorkerHandle<'_, Self>) {
        match self {
            Self::Gate { started, release } => {
                started.send(()).unwrap();
                release.recv().unwrap();
            }
            Self::Record(value) => worker.context().lock().push(value),
        }
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn owner_takes_newest_item_first() {
    with_watchdog(|| {
        let pool = Pool::<Step>::builder()
            .worker_count(1)
            .build(Mutex::new(Vec::new()))
            .unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        pool.schedule(Step::Gate {
            started: started_tx,
            release: release_rx,
        })
        .unwrap();

        // The only worker is now busy, so the next items pile up in its queue.
        started_rx.recv().unwrap();

        for value in 1..=3 {
            pool.schedule(Step::Record(value)).unwrap();
        }

        release_tx.send(()).unwrap();
        pool.shutdown();

        assert_eq!(*pool.context().lock(), vec![3, 2, 1]);
    });
}

/// Reports the worker it was pinned to and the worker that actually ran it.
struct Pinned {
    target: WorkerId,
}

impl WorkItem for Pinned {
    type Context = Mutex<Vec<(WorkerId, WorkerId)>>;

    fn affinity(&self) -> Option<WorkerId> {
        Some(self.target)
    }

    fn execute(self, worker: &WorkerHandle<'_, Self>) {
        worker.context().lock().push((self.target, worker.id()));
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn pinned_items_never_migrate() {
    with_watchdog(|| {
        const WORKERS: usize = 4;

        let pool = Pool::<Pinned>::builder()
            .worker_count(WORKERS)
            .build(Mutex::new(Vec::new()))
            .unwrap();

        // Everything pinned to one worker gives the others every reason to steal.
        for i in 0..400 {
            let target = if i % 3 == 0 { i % WORKERS } else { 0 };
            pool.schedule(Pinned {
                target: WorkerId::new(target),
            })
            .unwrap();
        }

        pool.shutdown();

        let runs = pool.context().lock();
        assert_eq!(runs.len(), 400);
        assert!(runs.iter().all(|(target, ran_on)| target == ran_on));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn pin_to_missing_worker_is_rejected() {
    with_watchdog(|| {
        let pool = Pool::<Pinned>::builder()
            .worker_count(2)
            .build(Mutex::new(Vec::new()))
            .unwrap();

        let rejected = pool
            .schedule(Pinned {
                target: WorkerId::new(2),
            })
            .unwrap_err();

        assert!(matches!(
            rejected.reason(),
            RuntimeError::InvalidAffinity {
                worker_count: 2,
                ..
            }
        ));
        assert_eq!(rejected.into_parts().0.target, WorkerId::new(2));
    });
}
