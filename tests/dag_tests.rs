//! Dependency-graph scenarios: fan-out/fan-in, diamonds, chains, and
//! randomized DAGs.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use fiberloom::{Scheduler, SchedulerConfig};

fn small_pool(workers: usize) -> Scheduler {
    Scheduler::new(SchedulerConfig {
        worker_count: Some(workers),
        ..SchedulerConfig::default()
    })
    .expect("scheduler init")
}

#[test]
fn fan_out_fan_in_sums_correctly() {
    let scheduler = small_pool(3);
    const LEN: usize = 10_000;
    const CHILDREN: usize = 40;
    const WINDOW: usize = LEN / CHILDREN;

    let data: Arc<Vec<AtomicU64>> = Arc::new((0..LEN).map(|_| AtomicU64::new(0)).collect());
    let partials: Arc<Vec<AtomicU64>> =
        Arc::new((0..CHILDREN).map(|_| AtomicU64::new(0)).collect());
    let result = Arc::new(AtomicU64::new(0));

    let fill = Arc::clone(&data);
    let root = scheduler
        .schedule("fill", move || {
            for (i, cell) in fill.iter().enumerate() {
                cell.store(i as u64 + 1, Ordering::Relaxed);
            }
        })
        .unwrap();

    let mut children = Vec::with_capacity(CHILDREN);
    for c in 0..CHILDREN {
        let data = Arc::clone(&data);
        let partials = Arc::clone(&partials);
        let child = scheduler
            .schedule_after("window-sum", root, move || {
                let sum: u64 = data[c * WINDOW..(c + 1) * WINDOW]
                    .iter()
                    .map(|cell| cell.load(Ordering::Relaxed))
                    .sum();
                partials[c].store(sum, Ordering::Relaxed);
            })
            .unwrap();
        children.push(child);
    }

    let partials_in = Arc::clone(&partials);
    let result_out = Arc::clone(&result);
    let reducer = scheduler
        .create("reduce", move || {
            let total = partials_in
                .iter()
                .map(|cell| cell.load(Ordering::Relaxed))
                .sum();
            result_out.store(total, Ordering::Relaxed);
        })
        .unwrap();
    for &child in &children {
        scheduler.add_dependency(reducer, child);
    }
    scheduler.submit(reducer).unwrap();

    scheduler.wait(reducer);
    let expected: u64 = (1..=LEN as u64).sum();
    assert_eq!(result.load(Ordering::Relaxed), expected);
    scheduler.shutdown();
}

#[test]
fn diamond_orders_join_after_both_branches() {
    let scheduler = small_pool(3);
    let epoch = Instant::now();
    let times: Arc<Vec<Mutex<(u128, u128)>>> =
        Arc::new((0..4).map(|_| Mutex::new((0, 0))).collect());

    let record = |times: &Arc<Vec<Mutex<(u128, u128)>>>, slot: usize, epoch: Instant| {
        let times = Arc::clone(times);
        move || {
            let start = epoch.elapsed().as_nanos();
            std::thread::sleep(std::time::Duration::from_millis(1));
            let end = epoch.elapsed().as_nanos();
            *times[slot].lock().unwrap() = (start, end);
        }
    };

    let root = scheduler.schedule("root", record(&times, 0, epoch)).unwrap();
    let a = scheduler
        .schedule_after("a", root, record(&times, 1, epoch))
        .unwrap();
    let b = scheduler
        .schedule_after("b", root, record(&times, 2, epoch))
        .unwrap();
    let join = scheduler.create("join", record(&times, 3, epoch)).unwrap();
    scheduler.add_dependency(join, a);
    scheduler.add_dependency(join, b);
    scheduler.submit(join).unwrap();

    scheduler.wait(join);

    let root_t = *times[0].lock().unwrap();
    let a_t = *times[1].lock().unwrap();
    let b_t = *times[2].lock().unwrap();
    let join_t = *times[3].lock().unwrap();

    assert!(root_t.1 <= a_t.0, "root must finish before A starts");
    assert!(root_t.1 <= b_t.0, "root must finish before B starts");
    assert!(
        join_t.0 >= a_t.1.max(b_t.1),
        "join must start after both branches end"
    );
    scheduler.shutdown();
}

#[test]
fn chain_executes_in_order() {
    let scheduler = small_pool(3);
    const DEPTH: usize = 1000;
    let order = Arc::new(Mutex::new(Vec::with_capacity(DEPTH)));

    let mut previous = fiberloom::JobHandle::NONE;
    let mut last = previous;
    for i in 0..DEPTH {
        let order = Arc::clone(&order);
        last = scheduler
            .schedule_after("link", previous, move || {
                order.lock().unwrap().push(i);
            })
            .unwrap();
        previous = last;
    }

    scheduler.wait(last);
    let order = order.lock().unwrap();
    assert_eq!(order.len(), DEPTH);
    for (position, &value) in order.iter().enumerate() {
        assert_eq!(value, position, "chain ran out of order");
    }
    scheduler.shutdown();
}

#[test]
fn randomized_dag_runs_every_job_exactly_once() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const JOBS: usize = 10_000;
    let scheduler = Scheduler::new(SchedulerConfig {
        worker_count: Some(3),
        job_capacity: 16_384,
        ..SchedulerConfig::default()
    })
    .expect("scheduler init");

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let ran: Arc<Vec<AtomicU8>> = Arc::new((0..JOBS).map(|_| AtomicU8::new(0)).collect());
    let executed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(JOBS);
    for i in 0..JOBS {
        let ran = Arc::clone(&ran);
        let executed = Arc::clone(&executed);
        let handle = scheduler
            .create("node", move || {
                let previous = ran[i].fetch_add(1, Ordering::Relaxed);
                assert_eq!(previous, 0, "job body ran twice");
                executed.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        // Random edges from earlier nodes keep the graph acyclic.
        if i > 0 {
            for _ in 0..rng.random_range(0..4usize) {
                let prerequisite = handles[rng.random_range(0..i)];
                scheduler.add_dependency(handle, prerequisite);
            }
        }
        handles.push(handle);
    }
    scheduler.submit_batch(&handles).unwrap();
    scheduler.wait_all(&handles);

    assert_eq!(executed.load(Ordering::Relaxed), JOBS);
    let stats = scheduler.stats();
    assert_eq!(stats.tasks_completed, JOBS as u64);
    assert_eq!(stats.tasks_cancelled, 0);
    scheduler.shutdown();
}
