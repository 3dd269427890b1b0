//! Scheduler lifecycle, queries, and the convenience surfaces.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use fiberloom::{
    JobHandle, JobOptions, Priority, Scheduler, SchedulerConfig, StackClass,
};

fn pool(workers: usize) -> Scheduler {
    Scheduler::new(SchedulerConfig {
        worker_count: Some(workers),
        ..SchedulerConfig::default()
    })
    .expect("scheduler init")
}

#[test]
fn init_promotes_caller_and_shutdown_demotes() {
    let scheduler = pool(2);
    // The creating thread is worker 0.
    assert_eq!(scheduler.current_worker_id(), Some(0));
    assert!(scheduler.current_job().is_none());

    let stats = scheduler.stats();
    assert_eq!(stats.worker_count, 3); // 2 spawned + promoted caller
    scheduler.shutdown();
    // Idempotent.
    scheduler.shutdown();
}

#[test]
fn simple_job_runs_once() {
    let scheduler = pool(2);
    let count = Arc::new(AtomicU32::new(0));
    let count_in = Arc::clone(&count);
    let handle = scheduler
        .schedule("simple", move || {
            count_in.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    scheduler.wait(handle);
    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert!(scheduler.is_complete(handle));
    scheduler.shutdown();
}

#[test]
fn current_job_is_visible_inside_the_body() {
    let scheduler = pool(1);
    let seen = Arc::new(AtomicU64::new(0));
    let seen_in = Arc::clone(&seen);
    let sched = scheduler.clone();
    let handle = scheduler
        .schedule("introspect", move || {
            let current = sched.current_job();
            assert!(!current.is_none());
            assert!(sched.current_worker_id().is_some());
            seen_in.store(1, Ordering::Relaxed);
        })
        .unwrap();
    scheduler.wait(handle);
    assert_eq!(seen.load(Ordering::Relaxed), 1);
    scheduler.shutdown();
}

#[test]
fn spawn_child_runs_after_parent() {
    let scheduler = pool(2);
    let order = Arc::new(AtomicU64::new(0));

    let order_parent = Arc::clone(&order);
    let parent = scheduler
        .create("parent", move || {
            order_parent
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .expect("parent must run first");
        })
        .unwrap();

    let order_child = Arc::clone(&order);
    let child = scheduler
        .spawn_child(parent, "child", move || {
            order_child
                .compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst)
                .expect("child must run after parent");
        })
        .unwrap();

    scheduler.submit(parent).unwrap();
    scheduler.wait(child);
    assert_eq!(order.load(Ordering::SeqCst), 2);
    scheduler.shutdown();
}

#[test]
fn parallel_for_covers_every_window() {
    let scheduler = pool(3);
    const COUNT: u32 = 10_000;

    let hits: Arc<Vec<AtomicU32>> = Arc::new((0..COUNT).map(|_| AtomicU32::new(0)).collect());
    let hits_in = Arc::clone(&hits);
    let join = scheduler
        .parallel_for("fill", COUNT, 64, move |start, end| {
            for i in start..end {
                hits_in[i as usize].fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();
    scheduler.wait(join);

    for (i, hit) in hits.iter().enumerate() {
        assert_eq!(hit.load(Ordering::Relaxed), 1, "index {i} visited wrongly");
    }
    scheduler.shutdown();
}

#[test]
fn high_priority_and_large_stack_jobs_run() {
    let scheduler = pool(2);
    let ran = Arc::new(AtomicU32::new(0));

    let ran_high = Arc::clone(&ran);
    let high = scheduler
        .schedule_with(
            "high",
            JobOptions {
                priority: Priority::High,
                ..JobOptions::default()
            },
            move || {
                ran_high.fetch_add(1, Ordering::Relaxed);
            },
        )
        .unwrap();

    let ran_large = Arc::clone(&ran);
    let large = scheduler
        .schedule_with(
            "deep",
            JobOptions {
                stack: StackClass::Large,
                ..JobOptions::default()
            },
            move || {
                // Burn some stack to make the large class meaningful.
                fn recurse(depth: u32, sink: &AtomicU32) {
                    let mut pad = [0u8; 2048];
                    pad[0] = depth as u8;
                    std::hint::black_box(&mut pad);
                    if depth > 0 {
                        recurse(depth - 1, sink);
                    } else {
                        sink.fetch_add(1, Ordering::Relaxed);
                    }
                }
                recurse(40, &ran_large);
            },
        )
        .unwrap();

    scheduler.wait_all(&[high, large]);
    assert_eq!(ran.load(Ordering::Relaxed), 2);
    scheduler.shutdown();
}

#[test]
fn panicking_job_is_cancelled_not_fatal() {
    let scheduler = pool(2);
    let after = Arc::new(AtomicU32::new(0));

    let bad = scheduler
        .schedule("explodes", || panic!("intentional test panic"))
        .unwrap();
    scheduler.wait(bad);

    // The pool survives and keeps executing.
    let after_in = Arc::clone(&after);
    let ok = scheduler
        .schedule("survivor", move || {
            after_in.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    scheduler.wait(ok);

    assert_eq!(after.load(Ordering::Relaxed), 1);
    assert_eq!(scheduler.stats().tasks_cancelled, 1);
    scheduler.shutdown();
}

#[test]
fn profiler_frames_capture_job_traces() {
    let scheduler = pool(2);
    scheduler.frame_start();

    let mut handles = Vec::new();
    for _ in 0..16 {
        handles.push(
            scheduler
                .schedule("traced", || {
                    std::hint::black_box((0..100u64).sum::<u64>());
                })
                .unwrap(),
        );
    }
    scheduler.wait_all(&handles);

    let frame = scheduler.frame_end();
    assert_eq!(frame.events.len(), 16);
    assert!(frame.events.iter().all(|e| e.name == "traced"));
    assert!(frame.events.iter().all(|e| e.end_ns >= e.start_ns));
    assert!(frame.frame_end_ns >= frame.frame_start_ns);

    let mut json = Vec::new();
    frame.write_chrome_trace(&mut json).unwrap();
    assert!(json.starts_with(b"["));

    // The next frame starts clean.
    scheduler.frame_start();
    let empty = scheduler.frame_end();
    assert!(empty.events.is_empty());
    scheduler.shutdown();
}

#[test]
fn config_round_trips_through_serde() {
    let config = SchedulerConfig {
        worker_count: Some(5),
        max_idle_spins: 123,
        ..SchedulerConfig::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.worker_count, Some(5));
    assert_eq!(back.max_idle_spins, 123);
    assert_eq!(back.job_capacity, config.job_capacity);
}

#[test]
fn wait_from_a_plain_thread_blocks_until_done() {
    let scheduler = pool(2);
    let done = Arc::new(AtomicU32::new(0));
    let done_in = Arc::clone(&done);
    let handle = scheduler
        .schedule("slow", move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            done_in.store(1, Ordering::Release);
        })
        .unwrap();

    let waiter_sched = scheduler.clone();
    let done_out = Arc::clone(&done);
    let waiter = std::thread::spawn(move || {
        waiter_sched.wait(handle);
        assert_eq!(done_out.load(Ordering::Acquire), 1);
    });
    waiter.join().unwrap();
    scheduler.shutdown();
}

#[test]
fn topology_is_exposed() {
    let scheduler = pool(1);
    let topology = scheduler.topology();
    assert!(!topology.nodes().is_empty());
    assert_eq!(topology.node_of(0), topology.node_of(0));
    scheduler.shutdown();
}

#[test]
fn stale_after_handle_schedules_immediately() {
    let scheduler = pool(1);
    let first = scheduler.schedule("first", || {}).unwrap();
    scheduler.wait(first);

    let ran = Arc::new(AtomicU32::new(0));
    let ran_in = Arc::clone(&ran);
    let second = scheduler
        .schedule_after("second", first, move || {
            ran_in.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    scheduler.wait(second);
    assert_eq!(ran.load(Ordering::Relaxed), 1);

    // The reserved none handle behaves the same way.
    let third = scheduler
        .schedule_after("third", JobHandle::NONE, || {})
        .unwrap();
    scheduler.wait(third);
    scheduler.shutdown();
}
