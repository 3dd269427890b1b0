//! Work-stealing stress: a single submitter, many thieves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fiberloom::{Scheduler, SchedulerConfig};

#[test]
fn stealers_drain_a_single_submitter() {
    const TOTAL: usize = 100_000;
    const WAVE: usize = 512;

    let scheduler = Scheduler::new(SchedulerConfig {
        worker_count: Some(3),
        ..SchedulerConfig::default()
    })
    .expect("scheduler init");

    let executed = Arc::new(AtomicU64::new(0));
    let mut submitted = 0usize;
    let mut wave = Vec::with_capacity(WAVE);

    while submitted < TOTAL {
        wave.clear();
        let batch = WAVE.min(TOTAL - submitted);
        for _ in 0..batch {
            let executed = Arc::clone(&executed);
            let handle = scheduler
                .schedule("noop", move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                })
                .expect("submission failed");
            wave.push(handle);
        }
        submitted += batch;
        // Waves keep the bounded queues and job table from overflowing
        // while still leaving plenty on the submitter's deque to steal.
        scheduler.wait_all(&wave);
    }

    assert_eq!(executed.load(Ordering::Relaxed), TOTAL as u64);

    let stats = scheduler.stats();
    assert_eq!(stats.tasks_submitted, TOTAL as u64);
    assert_eq!(stats.tasks_completed, TOTAL as u64);
    assert_eq!(stats.tasks_cancelled, 0);
    assert!(
        stats.total_steals_succeeded() > 0,
        "no worker ever stole from the submitter"
    );
    scheduler.shutdown();
}

#[test]
fn submissions_from_foreign_threads_land_on_the_global_queue() {
    let scheduler = Scheduler::new(SchedulerConfig {
        worker_count: Some(2),
        ..SchedulerConfig::default()
    })
    .expect("scheduler init");

    let executed = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    let mut joins = Vec::new();
    let (tx, rx) = std::sync::mpsc::channel();

    for _ in 0..4 {
        let scheduler = scheduler.clone();
        let executed = Arc::clone(&executed);
        let tx = tx.clone();
        joins.push(std::thread::spawn(move || {
            for _ in 0..100 {
                let executed = Arc::clone(&executed);
                let handle = scheduler
                    .schedule("foreign", move || {
                        executed.fetch_add(1, Ordering::Relaxed);
                    })
                    .expect("foreign submission");
                tx.send(handle).unwrap();
            }
        }));
    }
    drop(tx);
    while let Ok(handle) = rx.recv() {
        handles.push(handle);
    }
    for join in joins {
        join.join().unwrap();
    }

    scheduler.wait_all(&handles);
    assert_eq!(executed.load(Ordering::Relaxed), 400);

    let stats = scheduler.stats();
    assert!(
        stats.global_pushes >= 400,
        "foreign submissions must use the global queue"
    );
    scheduler.shutdown();
}
