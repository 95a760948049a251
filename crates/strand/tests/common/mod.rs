use std::sync::mpsc;
use std::sync::Once;
use std::thread;
use std::time::Duration;

static INIT: Once = Once::new();

/// Installs a test-sized runtime (fast 10 ms ticks) and drives worker 0 on a
/// background thread. Only the first call in a test binary configures it.
pub fn init_runtime(workers: usize) {
    INIT.call_once(move || {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let _ = strand::Builder::new()
            .worker_threads(workers)
            .timer_tick(10)
            .timer_slots(64)
            .build();
        thread::spawn(|| strand::run());
    });
}

/// Runs `f` on a fiber and blocks the test thread on its result.
#[allow(dead_code)]
pub fn run_fiber<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    strand::go(move || {
        let _ = tx.send(f());
    })
    .expect("fiber spawn failed");
    rx.recv_timeout(Duration::from_secs(30)).expect("fiber did not finish")
}
