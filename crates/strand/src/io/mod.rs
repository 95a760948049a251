//! Fiber-aware I/O facade.
//!
//! Every operation sets the fd non-blocking, issues the syscall, and on
//! would-block parks the calling fiber on its worker's readiness manager,
//! optionally bounded by a timer. Blocking semantics for the caller, no
//! blocked OS thread underneath.
//!
//! `timeout_ms` convention: `-1` waits forever, `0` returns immediately on
//! would-block, positive values bound the wait. Timeouts surface as
//! `io::ErrorKind::TimedOut`.
//!
//! All fds end up edge-triggered, including connections returned by
//! [`accept`]; the `_et` variants drain the descriptor until would-block
//! before parking, which the edge-triggered contract requires.

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::driver::{Direction, IoManager};
use crate::fiber;
use crate::runtime::timer::TimerHandle;
use crate::runtime::{current_worker, scheduler, WorkerShared};

/// Marks `fd` non-blocking.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl on a caller-supplied fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn timeout_error() -> io::Error {
    io::Error::from_raw_os_error(libc::ETIMEDOUT)
}

fn not_in_fiber() -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        "fiber I/O must be called from a fiber running on the runtime",
    )
}

#[inline]
fn is_retry_errno(raw: i32) -> bool {
    raw == libc::EAGAIN
        || raw == libc::EWOULDBLOCK
        || raw == libc::EINPROGRESS
        || raw == libc::EALREADY
}

/// Arms the park timeout for one facade call and arbitrates who "owns" the
/// wakeup: the timer callback and the completion path race on the `woken`
/// flag so exactly one of them acts, the other degrades into a cheap timer
/// cancellation.
struct ParkDeadline {
    timed_out: Arc<AtomicBool>,
    woken: Arc<AtomicBool>,
    timer: Option<TimerHandle>,
}

impl ParkDeadline {
    fn arm(worker: &Arc<WorkerShared>, fd: RawFd, direction: Direction, timeout_ms: i64) -> Self {
        let timed_out = Arc::new(AtomicBool::new(false));
        let woken = Arc::new(AtomicBool::new(false));
        let timer = if timeout_ms > 0 {
            let flag = timed_out.clone();
            let claimed = woken.clone();
            let io: Arc<IoManager> = worker.io().clone();
            worker.timer().add_timer(
                timeout_ms as u64,
                move || {
                    flag.store(true, Ordering::Release);
                    if !claimed.swap(true, Ordering::AcqRel) {
                        io.wake_up(fd, direction.mask());
                    }
                },
                false,
            )
        } else {
            None
        };
        Self {
            timed_out,
            woken,
            timer,
        }
    }

    fn expired(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Completion path claims the outcome; cancels the timer if the callback
    /// has not fired.
    fn disarm(&self) {
        if let Some(timer) = &self.timer {
            if !self.woken.swap(true, Ordering::AcqRel) {
                timer.cancel();
            }
        }
    }
}

/// Generic retry loop: run `op` until it succeeds, fails hard, or would
/// block; on would-block park on `fd` readiness and try again after wakeup.
pub(crate) fn do_io<F>(fd: RawFd, direction: Direction, mut op: F, timeout_ms: i64) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    let worker = current_worker().ok_or_else(not_in_fiber)?;
    if fiber::current().is_none() {
        return Err(not_in_fiber());
    }
    let manager = worker.io().clone();
    let deadline = ParkDeadline::arm(&worker, fd, direction, timeout_ms);

    loop {
        let result = op();
        if result >= 0 {
            deadline.disarm();
            return Ok(result as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(raw) if raw == libc::EINTR => continue,
            Some(raw) if is_retry_errno(raw) => {}
            _ => {
                deadline.disarm();
                return Err(err);
            }
        }
        if timeout_ms == 0 || deadline.expired() {
            return Err(timeout_error());
        }
        if !manager.add_event(fd, direction) {
            deadline.disarm();
            return Err(io::Error::new(io::ErrorKind::Other, "event registration failed"));
        }
        fiber::block_yield();
        manager.del_event(fd, direction);
        if deadline.expired() {
            return Err(timeout_error());
        }
    }
}

/// Reads up to `buf.len()` bytes. EOF is `Ok(0)`.
pub fn read(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> io::Result<usize> {
    let _ = set_nonblocking(fd);
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(
        fd,
        Direction::Read,
        move || unsafe { libc::read(fd, ptr as *mut libc::c_void, len) },
        timeout_ms,
    )
}

/// Edge-triggered read: drains the fd into `buf` until would-block, EOF, or
/// a full buffer; parks only when nothing was read yet.
pub fn read_et(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> io::Result<usize> {
    let _ = set_nonblocking(fd);
    drain_et(fd, timeout_ms, |cursor: &mut usize, buf: &mut [u8]| unsafe {
        libc::read(
            fd,
            buf[*cursor..].as_mut_ptr() as *mut libc::c_void,
            buf.len() - *cursor,
        )
    }, buf)
}

/// Writes up to `buf.len()` bytes.
pub fn write(fd: RawFd, buf: &[u8], timeout_ms: i64) -> io::Result<usize> {
    let _ = set_nonblocking(fd);
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(
        fd,
        Direction::Write,
        move || unsafe { libc::write(fd, ptr as *const libc::c_void, len) },
        timeout_ms,
    )
}

/// Gathered write of `bufs`.
pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>], timeout_ms: i64) -> io::Result<usize> {
    let _ = set_nonblocking(fd);
    let iov = bufs.as_ptr() as *const libc::iovec;
    let count = bufs.len() as libc::c_int;
    do_io(
        fd,
        Direction::Write,
        move || unsafe { libc::writev(fd, iov, count) },
        timeout_ms,
    )
}

/// Zero-copy file-to-socket transfer via `sendfile(2)`.
pub fn sendfile(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<&mut libc::off_t>,
    count: usize,
    timeout_ms: i64,
) -> io::Result<usize> {
    let _ = set_nonblocking(out_fd);
    let off = offset.map_or(ptr::null_mut(), |o| o as *mut libc::off_t);
    do_io(
        out_fd,
        Direction::Write,
        move || unsafe { libc::sendfile(out_fd, in_fd, off, count) },
        timeout_ms,
    )
}

/// Receives up to `buf.len()` bytes with `recv(2)` flags.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32, timeout_ms: i64) -> io::Result<usize> {
    let _ = set_nonblocking(fd);
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(
        fd,
        Direction::Read,
        move || unsafe { libc::recv(fd, ptr as *mut libc::c_void, len, flags) },
        timeout_ms,
    )
}

/// Edge-triggered receive: drains until would-block, EOF, or a full buffer.
pub fn recv_et(fd: RawFd, buf: &mut [u8], flags: i32, timeout_ms: i64) -> io::Result<usize> {
    let _ = set_nonblocking(fd);
    drain_et(fd, timeout_ms, move |cursor: &mut usize, buf: &mut [u8]| unsafe {
        libc::recv(
            fd,
            buf[*cursor..].as_mut_ptr() as *mut libc::c_void,
            buf.len() - *cursor,
            flags,
        )
    }, buf)
}

fn drain_et<F>(fd: RawFd, timeout_ms: i64, mut op: F, buf: &mut [u8]) -> io::Result<usize>
where
    F: FnMut(&mut usize, &mut [u8]) -> libc::ssize_t,
{
    let worker = current_worker().ok_or_else(not_in_fiber)?;
    if fiber::current().is_none() {
        return Err(not_in_fiber());
    }
    let manager = worker.io().clone();
    let deadline = ParkDeadline::arm(&worker, fd, Direction::Read, timeout_ms);
    let mut total = 0usize;

    loop {
        while total < buf.len() {
            let result = op(&mut total, buf);
            if result > 0 {
                total += result as usize;
                continue;
            }
            if result == 0 {
                // EOF; hand back whatever accumulated.
                deadline.disarm();
                return Ok(total);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(raw) if raw == libc::EINTR => continue,
                Some(raw) if raw == libc::EAGAIN || raw == libc::EWOULDBLOCK => break,
                _ => {
                    deadline.disarm();
                    return Err(err);
                }
            }
        }
        if total > 0 {
            deadline.disarm();
            return Ok(total);
        }
        if timeout_ms == 0 || deadline.expired() {
            return Err(timeout_error());
        }
        if !manager.add_event(fd, Direction::Read) {
            deadline.disarm();
            return Err(io::Error::new(io::ErrorKind::Other, "event registration failed"));
        }
        fiber::block_yield();
        manager.del_event(fd, Direction::Read);
        if deadline.expired() {
            return Err(timeout_error());
        }
    }
}

/// Accepts one connection; the returned fd is made non-blocking and inherits
/// edge-triggered semantics like every other fd.
pub fn accept(fd: RawFd, timeout_ms: i64) -> io::Result<RawFd> {
    let _ = set_nonblocking(fd);
    let client = do_io(
        fd,
        Direction::Read,
        move || unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) as libc::ssize_t },
        timeout_ms,
    )? as RawFd;
    let _ = set_nonblocking(client);
    Ok(client)
}

/// Edge-triggered accept. Every listener here is registered edge-triggered,
/// so this is the same retry-until-would-block loop as [`accept`]; kept as a
/// distinct entry point for callers that pair it with `read_et`/`recv_et`.
pub fn accept_et(fd: RawFd, timeout_ms: i64) -> io::Result<RawFd> {
    accept(fd, timeout_ms)
}

/// Connects `fd` to `addr`. `EINPROGRESS` parks on writability, then
/// `SO_ERROR` decides the outcome.
pub fn connect(
    fd: RawFd,
    addr: &libc::sockaddr,
    addr_len: libc::socklen_t,
    timeout_ms: i64,
) -> io::Result<()> {
    set_nonblocking(fd)?;
    // SAFETY: addr/addr_len come from the caller as a matched pair.
    let rc = unsafe { libc::connect(fd, addr as *const libc::sockaddr, addr_len) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let worker = current_worker().ok_or_else(not_in_fiber)?;
    if fiber::current().is_none() {
        return Err(not_in_fiber());
    }
    let manager = worker.io().clone();
    let deadline = ParkDeadline::arm(&worker, fd, Direction::Write, timeout_ms);
    if !manager.add_event(fd, Direction::Write) {
        deadline.disarm();
        return Err(io::Error::new(io::ErrorKind::Other, "event registration failed"));
    }
    fiber::block_yield();
    manager.del_event(fd, Direction::Write);
    if deadline.expired() {
        return Err(timeout_error());
    }
    deadline.disarm();

    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: out-params sized above.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error));
    }
    Ok(())
}

/// Wakes every fiber parked on `fd` (both directions, on every worker), then
/// closes the descriptor. A fiber parked on a closed fd returns promptly
/// with an I/O error instead of hanging.
pub fn close(fd: RawFd) -> io::Result<()> {
    scheduler().wake_fd_everywhere(fd);
    // SAFETY: caller owns the fd.
    let rc = unsafe { libc::close(fd) };
    // Second sweep: a fiber that raced the first wake and re-parked between
    // it and the close would otherwise wait on a descriptor the poller no
    // longer watches.
    scheduler().wake_fd_everywhere(fd);
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `shutdown(2)`; waiters learn about it through HUP readiness, but the
/// matching direction is woken eagerly as well.
pub fn shutdown(fd: RawFd, how: libc::c_int) -> io::Result<()> {
    // SAFETY: plain shutdown on a caller-supplied fd.
    if unsafe { libc::shutdown(fd, how) } < 0 {
        return Err(io::Error::last_os_error());
    }
    scheduler().wake_fd_everywhere(fd);
    Ok(())
}
