//! Scheduler and synchronization primitives under real fiber load.

mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use rand::Rng;
use strand::sync::{Channel, Condition, Mutex, WaitGroup};
use strand::PopError;

use common::{init_runtime, run_fiber};

#[test]
fn producer_consumer_sums_all_values() {
    init_runtime(4);

    const PRODUCERS: u64 = 8;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u64 = 1000;

    let channel: Arc<Channel<u64>> = Arc::new(Channel::new(16));
    let sum = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicUsize::new(0));
    let producers = Arc::new(WaitGroup::new());
    let consumers = Arc::new(WaitGroup::new());
    producers.add(PRODUCERS as i64).unwrap();
    consumers.add(CONSUMERS as i64).unwrap();

    for _ in 0..PRODUCERS {
        let channel = channel.clone();
        let producers = producers.clone();
        strand::go(move || {
            for value in 1..=PER_PRODUCER {
                channel.send(value).unwrap();
            }
            producers.done();
        })
        .unwrap();
    }

    for _ in 0..CONSUMERS {
        let channel = channel.clone();
        let sum = sum.clone();
        let received = received.clone();
        let consumers = consumers.clone();
        strand::go(move || {
            loop {
                match channel.recv() {
                    Ok(value) => {
                        sum.fetch_add(value, Ordering::Relaxed);
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(PopError::Closed) => break,
                    Err(PopError::Empty) => unreachable!("recv never reports Empty"),
                }
            }
            consumers.done();
        })
        .unwrap();
    }

    let (tx, rx) = mpsc::channel();
    {
        let channel = channel.clone();
        strand::go(move || {
            producers.wait();
            channel.close();
            consumers.wait();
            let _ = tx.send(());
        })
        .unwrap();
    }
    rx.recv_timeout(Duration::from_secs(30)).expect("pipeline stalled");

    assert_eq!(sum.load(Ordering::Relaxed), PRODUCERS * 500_500);
    assert_eq!(received.load(Ordering::Relaxed), (PRODUCERS * PER_PRODUCER) as usize);
    assert!(channel.is_empty());
}

#[test]
fn mutex_excludes_concurrent_increments() {
    init_runtime(4);

    const FIBERS: usize = 16;
    const ROUNDS: usize = 10_000;

    let mutex = Arc::new(Mutex::new());
    // Plain load/store under the lock: lost updates would show up in the
    // final count if mutual exclusion ever broke.
    let counter = Arc::new(AtomicU64::new(0));
    let wg = Arc::new(WaitGroup::new());
    wg.add(FIBERS as i64).unwrap();

    for _ in 0..FIBERS {
        let mutex = mutex.clone();
        let counter = counter.clone();
        let wg = wg.clone();
        strand::go(move || {
            for _ in 0..ROUNDS {
                mutex.lock();
                let value = counter.load(Ordering::Relaxed);
                counter.store(value + 1, Ordering::Relaxed);
                mutex.unlock().unwrap();
            }
            wg.done();
        })
        .unwrap();
    }

    run_fiber({
        let wg = wg.clone();
        move || wg.wait()
    });
    assert_eq!(counter.load(Ordering::Relaxed), (FIBERS * ROUNDS) as u64);
    assert!(!mutex.is_locked());
}

#[test]
fn try_lock_is_exclusive() {
    init_runtime(4);
    let mutex = Arc::new(Mutex::new());
    let m = mutex.clone();
    let observed = run_fiber(move || {
        assert!(m.try_lock());
        let reentry = m.try_lock();
        m.unlock().unwrap();
        reentry
    });
    assert!(!observed, "second try_lock succeeded while held");
}

#[test]
fn unlock_of_unlocked_mutex_is_detected() {
    init_runtime(4);
    let mutex = Arc::new(Mutex::new());
    let m = mutex.clone();
    let result = run_fiber(move || m.unlock());
    assert!(result.is_err());
}

#[test]
fn waitgroup_waits_for_jittered_fibers() {
    init_runtime(4);

    const FIBERS: usize = 100;
    let wg = Arc::new(WaitGroup::new());
    wg.add(FIBERS as i64).unwrap();

    for _ in 0..FIBERS {
        let wg = wg.clone();
        strand::go(move || {
            let jitter = rand::thread_rng().gen_range(0..20);
            strand::sleep(jitter);
            wg.done();
        })
        .unwrap();
    }

    let waited = run_fiber({
        let wg = wg.clone();
        move || {
            wg.wait();
            wg.count()
        }
    });
    assert_eq!(waited, 0);
}

#[test]
fn waitgroup_rejects_negative_counter() {
    let wg = WaitGroup::new();
    wg.add(1).unwrap();
    assert!(wg.add(-2).is_err());
    // Rollback keeps the original count.
    assert_eq!(wg.count(), 1);
}

#[test]
fn condition_wait_for_times_out_and_notifies() {
    init_runtime(4);

    let pair = Arc::new((Mutex::new(), Condition::new()));

    // Timeout path: nobody notifies.
    let p = pair.clone();
    let timed_out = run_fiber(move || {
        let (mutex, condition) = &*p;
        mutex.lock();
        let notified = condition.wait_for(mutex, 30).unwrap();
        mutex.unlock().unwrap();
        notified
    });
    assert!(!timed_out, "expected a timeout wake");

    // Notify path: a second fiber signals well before the deadline.
    let p = pair.clone();
    let notified = run_fiber(move || {
        let (mutex, condition) = &*p;
        {
            let p = p.clone();
            strand::go(move || {
                strand::sleep(20);
                p.1.notify_one();
            })
            .unwrap();
        }
        mutex.lock();
        let notified = condition.wait_for(mutex, 5_000).unwrap();
        mutex.unlock().unwrap();
        notified
    });
    assert!(notified, "expected a notify wake");
}

#[test]
fn condition_broadcast_wakes_every_waiter() {
    init_runtime(4);

    let pair = Arc::new((Mutex::new(), Condition::new()));
    let awake = Arc::new(AtomicUsize::new(0));
    let wg = Arc::new(WaitGroup::new());
    wg.add(5).unwrap();

    for _ in 0..5 {
        let pair = pair.clone();
        let awake = awake.clone();
        let wg = wg.clone();
        strand::go(move || {
            let (mutex, condition) = &*pair;
            mutex.lock();
            condition.wait(mutex).unwrap();
            mutex.unlock().unwrap();
            awake.fetch_add(1, Ordering::SeqCst);
            wg.done();
        })
        .unwrap();
    }

    run_fiber({
        let pair = pair.clone();
        let wg = wg.clone();
        move || {
            // Let the waiters park before broadcasting.
            strand::sleep(30);
            pair.1.notify_all();
            wg.wait();
        }
    });
    assert_eq!(awake.load(Ordering::SeqCst), 5);
}

#[test]
fn spawned_fibers_inherit_trace_id() {
    init_runtime(4);
    let (parent_trace, child_trace) = run_fiber(|| {
        let parent = strand::current().unwrap();
        let child = strand::go(|| {}).unwrap();
        (parent.trace_id(), child.trace_id())
    });
    assert_eq!(parent_trace, child_trace);
}

#[test]
fn cooperative_yield_interleaves_on_one_worker() {
    init_runtime(4);
    // Two fibers spawned from the same parent share a trace id and therefore
    // a worker; yielding must interleave them rather than starve one.
    let interleavings = run_fiber(|| {
        let turn = Arc::new(AtomicU64::new(0));
        let wg = Arc::new(WaitGroup::new());
        wg.add(2).unwrap();
        for parity in 0..2u64 {
            let turn = turn.clone();
            let wg = wg.clone();
            strand::go(move || {
                for _ in 0..100 {
                    if turn.load(Ordering::Relaxed) % 2 == parity {
                        turn.fetch_add(1, Ordering::Relaxed);
                    }
                    strand::yield_now();
                }
                wg.done();
            })
            .unwrap();
        }
        wg.wait();
        turn.load(Ordering::Relaxed)
    });
    assert!(interleavings >= 100, "fibers failed to interleave: {interleavings}");
}
