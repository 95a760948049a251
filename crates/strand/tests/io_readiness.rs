//! I/O facade against real descriptors: pipes, TCP sockets, socket pairs.

mod common;

use std::net::TcpListener;
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use strand::io;
use strand::scheduler;

use common::{init_runtime, run_fiber};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(rc, 0, "pipe2 failed");
    (fds[0], fds[1])
}

fn socket_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
    };
    assert_eq!(rc, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn sockaddr_for(port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(std::net::Ipv4Addr::LOCALHOST).to_be(),
        },
        sin_zero: [0; 8],
    }
}

#[test]
fn read_times_out_on_idle_pipe() {
    init_runtime(4);
    let (read_end, write_end) = pipe();

    let (elapsed_ms, err, context_left) = run_fiber(move || {
        let mut buf = [0u8; 1024];
        let start = Instant::now();
        let result = io::read(read_end, &mut buf, 50);
        let elapsed = start.elapsed().as_millis() as u64;
        let context = scheduler()
            .this_worker_io_manager()
            .unwrap()
            .has_context(read_end);
        (elapsed, result.unwrap_err(), context)
    });

    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    assert!(
        (45..200).contains(&elapsed_ms),
        "timeout took {elapsed_ms} ms"
    );
    assert!(!context_left, "fd context leaked after timeout");

    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
}

#[test]
fn read_returns_buffered_data_immediately() {
    init_runtime(4);
    let (read_end, write_end) = pipe();
    let payload = b"ready before the fiber asks";
    let written = unsafe {
        libc::write(write_end, payload.as_ptr() as *const libc::c_void, payload.len())
    };
    assert_eq!(written, payload.len() as isize);

    let received = run_fiber(move || {
        let mut buf = [0u8; 64];
        let n = io::read(read_end, &mut buf, 1000).unwrap();
        buf[..n].to_vec()
    });
    assert_eq!(received, payload);

    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
}

#[test]
fn read_wakes_when_writer_arrives_late() {
    init_runtime(4);
    let (read_end, write_end) = pipe();

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(40));
        let payload = b"late";
        unsafe {
            libc::write(write_end, payload.as_ptr() as *const libc::c_void, payload.len());
            libc::close(write_end);
        }
    });

    let received = run_fiber(move || {
        let mut buf = [0u8; 16];
        let n = io::read(read_end, &mut buf, -1).unwrap();
        buf[..n].to_vec()
    });
    assert_eq!(received, b"late");
    unsafe { libc::close(read_end) };
}

#[test]
fn close_wakes_parked_accept() {
    init_runtime(4);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let listen_fd = listener.into_raw_fd();

    let (tx, rx) = mpsc::channel();
    strand::go(move || {
        let start = Instant::now();
        let result = io::accept(listen_fd, -1);
        let _ = tx.send((result.err().map(|e| e.kind()), start.elapsed()));
    })
    .unwrap();

    // Give the acceptor time to park, then close underneath it.
    run_fiber(move || {
        strand::sleep(10);
        io::close(listen_fd).unwrap();
    });

    let (err, waited) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(err.is_some(), "accept on a closed listener must fail");
    assert!(waited < Duration::from_millis(200), "accept hung for {waited:?}");
}

#[test]
fn edge_triggered_read_drains_large_burst() {
    init_runtime(4);
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 8;
    let (ours, theirs) = socket_pair();

    let writer = thread::spawn(move || {
        let data = vec![0x5a_u8; CHUNK];
        for _ in 0..CHUNKS {
            let mut sent = 0;
            while sent < CHUNK {
                let n = unsafe {
                    libc::write(
                        theirs,
                        data[sent..].as_ptr() as *const libc::c_void,
                        CHUNK - sent,
                    )
                };
                assert!(n > 0, "peer write failed");
                sent += n as usize;
            }
        }
        unsafe { libc::close(theirs) };
    });

    let (total, calls, clean) = run_fiber(move || {
        let mut buf = vec![0u8; CHUNK * CHUNKS];
        let mut total = 0;
        let mut calls = 0;
        while total < buf.len() {
            let n = io::read_et(ours, &mut buf[total..], 5_000).unwrap();
            if n == 0 {
                break;
            }
            total += n;
            calls += 1;
        }
        let clean = buf[..total].iter().all(|&b| b == 0x5a);
        (total, calls, clean)
    });

    writer.join().unwrap();
    assert_eq!(total, CHUNK * CHUNKS);
    assert!(clean, "payload corrupted");
    assert!(calls <= CHUNKS, "drained in {calls} calls, expected few");
    unsafe { libc::close(ours) };
}

#[test]
fn connect_accept_echo_roundtrip() {
    init_runtime(4);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let listen_fd = listener.into_raw_fd();

    // Server fiber: accept one client and echo what it reads.
    strand::go(move || {
        let client = io::accept(listen_fd, 5_000).expect("accept failed");
        let mut buf = [0u8; 256];
        let n = io::read_et(client, &mut buf, 5_000).expect("server read failed");
        let mut sent = 0;
        while sent < n {
            sent += io::write(client, &buf[sent..n], 5_000).expect("server write failed");
        }
        let _ = io::close(client);
        let _ = io::close(listen_fd);
    })
    .unwrap();

    let echoed = run_fiber(move || {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        assert!(fd >= 0);
        let addr = sockaddr_for(port);
        io::connect(
            fd,
            unsafe { &*(&addr as *const libc::sockaddr_in as *const libc::sockaddr) },
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            5_000,
        )
        .expect("connect failed");

        let payload = b"around the loop and back";
        let mut sent = 0;
        while sent < payload.len() {
            sent += io::write(fd, &payload[sent..], 5_000).expect("client write failed");
        }
        let mut buf = [0u8; 256];
        let mut got = 0;
        while got < payload.len() {
            let n = io::read(fd, &mut buf[got..], 5_000).expect("client read failed");
            if n == 0 {
                break;
            }
            got += n;
        }
        let _ = io::close(fd);
        buf[..got].to_vec()
    });
    assert_eq!(echoed, b"around the loop and back");
}

#[test]
fn connect_to_dead_port_reports_error() {
    init_runtime(4);
    // Bind-then-drop gives a port with nothing listening.
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let result: Result<(), std::io::ErrorKind> = run_fiber(move || {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        let addr = sockaddr_for(port);
        let outcome = io::connect(
            fd,
            unsafe { &*(&addr as *const libc::sockaddr_in as *const libc::sockaddr) },
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            2_000,
        )
        .map_err(|e| e.kind());
        let _ = io::close(fd);
        outcome
    });
    assert!(result.is_err(), "connect to a dead port succeeded");
}

#[test]
fn writev_gathers_slices() {
    init_runtime(4);
    let (read_end, write_end) = pipe();
    let written = run_fiber(move || {
        let parts = [
            std::io::IoSlice::new(b"scatter"),
            std::io::IoSlice::new(b"-"),
            std::io::IoSlice::new(b"gather"),
        ];
        io::writev(write_end, &parts, 1_000).unwrap()
    });
    assert_eq!(written, "scatter-gather".len());

    let mut buf = [0u8; 32];
    let n = unsafe { libc::read(read_end, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    assert_eq!(&buf[..n as usize], b"scatter-gather");
    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
}
