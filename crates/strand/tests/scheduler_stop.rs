//! Lifecycle: run on the caller thread, stop from outside, drain of parked
//! fibers, post-stop scheduling behavior. Lives in its own binary because
//! stop is process-wide.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use strand::sync::Channel;

fn pipe() -> (i32, i32) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(rc, 0, "pipe2 failed");
    (fds[0], fds[1])
}

#[test]
fn stop_drains_ready_and_parked_fibers() {
    strand::Builder::new()
        .worker_threads(2)
        .timer_tick(10)
        .build()
        .unwrap();
    // Double-install is refused.
    assert!(strand::Builder::new().build().is_err());
    assert_eq!(strand::worker_count(), 2);

    let ran = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    {
        let ran = ran.clone();
        strand::go(move || {
            ran.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        })
        .unwrap();
    }

    let runner = thread::spawn(|| strand::run());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ran.load(Ordering::SeqCst));

    // Two fibers that will be Blocked when stop arrives: one parked forever
    // on an idle pipe, one parked on an empty channel. The drain must
    // force-wake the reader (whose retry then fails against the stopped
    // manager), and its completion hands the receiver its value.
    let (read_end, write_end) = pipe();
    let chain: Arc<Channel<u8>> = Arc::new(Channel::new(1));
    let io_failed = Arc::new(AtomicBool::new(false));
    let recv_done = Arc::new(AtomicBool::new(false));

    {
        let chain = chain.clone();
        let io_failed = io_failed.clone();
        strand::go(move || {
            let mut buf = [0u8; 16];
            if strand::io::read(read_end, &mut buf, -1).is_err() {
                io_failed.store(true, Ordering::SeqCst);
            }
            let _ = chain.send(1);
            chain.close();
        })
        .unwrap();
    }
    {
        let chain = chain.clone();
        let recv_done = recv_done.clone();
        strand::go(move || {
            if chain.recv().is_ok() {
                recv_done.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
    }

    // Let both fibers reach their parked state before stopping.
    thread::sleep(Duration::from_millis(100));

    strand::stop();
    runner.join().expect("run() did not return after stop()");

    assert!(
        io_failed.load(Ordering::SeqCst),
        "fd-parked fiber was not drained"
    );
    assert!(
        recv_done.load(Ordering::SeqCst),
        "channel-parked fiber was not drained"
    );

    // Scheduling after stop drops the fiber instead of queueing it.
    let orphan = strand::go(|| unreachable!("ran after stop")).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(orphan.state(), strand::FiberState::Ready);
    assert_eq!(strand::scheduler().ready_fibers(), 0);

    // A finished fiber is never enqueued again.
    let done = strand::Fiber::create(|| {}, 64 * 1024).unwrap();
    strand::resume(&done);
    assert_eq!(done.state(), strand::FiberState::Done);
    strand::scheduler().schedule(done.clone());
    assert_eq!(strand::scheduler().ready_fibers(), 0);

    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
}
