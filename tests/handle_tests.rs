//! Generation-tagged handle safety across slot reuse.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fiberloom::{JobHandle, Scheduler, SchedulerConfig};

#[test]
fn stale_handle_reads_as_completed_after_reuse() {
    // A tiny table forces slot reuse quickly.
    let scheduler = Scheduler::new(SchedulerConfig {
        worker_count: Some(1),
        job_capacity: 8,
        ..SchedulerConfig::default()
    })
    .expect("scheduler init");

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in = Arc::clone(&ran);
    let original = scheduler
        .schedule("original", move || {
            ran_in.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    scheduler.wait(original);
    assert!(scheduler.is_complete(original));

    // Cycle every slot several times over.
    let churn = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let churn = Arc::clone(&churn);
        let h = scheduler
            .schedule("churn", move || {
                churn.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        scheduler.wait(h);
    }
    assert_eq!(churn.load(Ordering::Relaxed), 64);

    // The retired handle still answers as completed and wait returns
    // immediately; the body did not run again.
    assert!(scheduler.is_complete(original));
    scheduler.wait(original);
    assert_eq!(ran.load(Ordering::Relaxed), 1);

    // Operations on the stale handle do not disturb a live occupant.
    let live = scheduler.schedule("live", || {}).unwrap();
    scheduler.wait(original);
    scheduler.wait(live);
    assert!(scheduler.is_complete(live));

    scheduler.shutdown();
}

#[test]
fn none_handle_is_always_complete() {
    let scheduler = Scheduler::new(SchedulerConfig {
        worker_count: Some(1),
        ..SchedulerConfig::default()
    })
    .expect("scheduler init");

    assert!(scheduler.is_complete(JobHandle::NONE));
    scheduler.wait(JobHandle::NONE);
    scheduler.wait_all(&[JobHandle::NONE, JobHandle::NONE]);
    scheduler.shutdown();
}

#[test]
fn table_exhaustion_is_reported() {
    let scheduler = Scheduler::new(SchedulerConfig {
        worker_count: Some(1),
        job_capacity: 4,
        ..SchedulerConfig::default()
    })
    .expect("scheduler init");

    // Fill the table with jobs that cannot run yet.
    let mut held = Vec::new();
    loop {
        match scheduler.create("held", || {}) {
            Ok(handle) => held.push(handle),
            Err(err) => {
                assert_eq!(err, fiberloom::ScheduleError::TableExhausted);
                break;
            }
        }
        assert!(held.len() <= 8, "table never reported exhaustion");
    }

    // Releasing them drains the table again.
    scheduler.submit_batch(&held).unwrap();
    scheduler.wait_all(&held);
    assert!(scheduler.schedule("after", || {}).is_ok());
    scheduler.shutdown();
}
