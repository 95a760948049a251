//! # strand
//!
//! A stackful coroutine runtime for Linux. Application code is written in
//! straight-line blocking style; the runtime multiplexes many such fibers
//! over a small pool of worker threads, driving I/O readiness through
//! per-worker edge-triggered pollers and time through hashed timer wheels.
//!
//! ```no_run
//! use strand::sync::WaitGroup;
//! use std::sync::Arc;
//!
//! let wg = Arc::new(WaitGroup::new());
//! wg.add(1).unwrap();
//! let wg2 = wg.clone();
//! strand::go(move || {
//!     println!("hello from fiber {}", strand::current().unwrap().id());
//!     wg2.done();
//!     strand::stop();
//! })
//! .unwrap();
//! strand::run();
//! ```

pub mod builder;
pub mod driver;
pub mod fiber;
pub mod io;
pub mod runtime;
pub mod sync;
pub(crate) mod utils;

pub use builder::Builder;
pub use fiber::{
    block_yield, current, go, go_with_stack, resume, sleep, yield_now, Fiber, FiberHandle,
    FiberState, RunMode,
};
pub use runtime::{run, scheduler, stop, worker_count, Scheduler};

use std::fmt;

/// Error occurring when pushing into a channel is unsuccessful.
#[derive(Debug, Eq, PartialEq)]
pub enum PushError<T> {
    /// The channel is full.
    Full(T),
    /// The channel has been closed.
    Closed(T),
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "channel is full"),
            PushError::Closed(_) => write!(f, "channel is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

/// Error occurring when popping from a channel is unsuccessful.
#[derive(Debug, Eq, PartialEq)]
pub enum PopError {
    /// The channel is empty.
    Empty,
    /// The channel has been closed and drained.
    Closed,
}

impl fmt::Display for PopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopError::Empty => write!(f, "channel is empty"),
            PopError::Closed => write!(f, "channel is closed"),
        }
    }
}

impl std::error::Error for PopError {}

/// Errors surfaced by the runtime core.
///
/// Internal errors never unwind through a fiber switch; they are returned to
/// the nearest caller.
#[derive(Debug)]
pub enum Error {
    /// A kernel syscall failed with something other than would-block.
    Io(std::io::Error),
    /// A deadline elapsed before the awaited condition.
    Timeout,
    /// The resource was closed mid-wait.
    Closed,
    /// An operation violated lifecycle order (unlock of a non-held mutex,
    /// negative wait-group counter, resume of a finished fiber).
    InvalidState(&'static str),
    /// Stack allocation, event registration, or timer creation failed.
    OutOfResource(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::Timeout => write!(f, "deadline has elapsed"),
            Error::Closed => write!(f, "resource closed"),
            Error::InvalidState(what) => write!(f, "invalid state: {what}"),
            Error::OutOfResource(what) => write!(f, "out of resource: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
