//! Bounded MPMC channel for fibers.
//!
//! A lock-free ring of slots carries the values; send-side and recv-side
//! wait queues carry the fibers. `send` parks on full, `recv` parks on
//! empty; `close` wakes everyone, after which sends fail and receives drain
//! whatever remains before reporting closed.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::sync::WaitQueue;
use crate::{PopError, PushError};

struct Slot<T> {
    data: AtomicPtr<T>,
}

/// Bounded channel of capacity `cap` (a zero capacity is promoted to one
/// slot). Ring indices run modulo `cap + 1`, keeping one empty pivot slot.
pub struct Channel<T> {
    ring: Box<[Slot<T>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    closed: AtomicBool,
    send_waiters: WaitQueue,
    recv_waiters: WaitQueue,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Channel<T> {}
unsafe impl<T: Send> Sync for Channel<T> {}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        let ring_len = capacity.max(1) + 1;
        let mut ring = Vec::with_capacity(ring_len);
        ring.resize_with(ring_len, || Slot {
            data: AtomicPtr::new(ptr::null_mut()),
        });
        Self {
            ring: ring.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            send_waiters: WaitQueue::new(),
            recv_waiters: WaitQueue::new(),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.ring.len()
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = self.next_index(tail);
        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }
        let boxed = Box::into_raw(Box::new(value));
        if self.ring[tail]
            .data
            .compare_exchange(ptr::null_mut(), boxed, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            self.tail.store(next, Ordering::Release);
            Ok(())
        } else {
            // Another producer claimed the slot; take the value back.
            Err(unsafe { *Box::from_raw(boxed) })
        }
    }

    fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let data = self.ring[head].data.swap(ptr::null_mut(), Ordering::Acquire);
        if data.is_null() {
            return None;
        }
        self.head.store(self.next_index(head), Ordering::Release);
        Some(unsafe { *Box::from_raw(data) })
    }

    /// Sends `value`, parking while the channel is full. Fails once closed.
    pub fn send(&self, value: T) -> Result<(), PushError<T>> {
        if self.is_closed() {
            return Err(PushError::Closed(value));
        }
        let mut value = value;
        match self.try_push(value) {
            Ok(()) => {
                self.recv_waiters.notify_one();
                return Ok(());
            }
            Err(v) => value = v,
        }
        loop {
            self.send_waiters
                .wait_or(|| !self.is_full() || self.is_closed());
            if self.is_closed() {
                return Err(PushError::Closed(value));
            }
            match self.try_push(value) {
                Ok(()) => {
                    self.recv_waiters.notify_one();
                    return Ok(());
                }
                Err(v) => value = v,
            }
        }
    }

    /// Receives a value, parking while the channel is empty. After close,
    /// remaining values drain before `Closed` is reported.
    pub fn recv(&self) -> Result<T, PopError> {
        if let Some(value) = self.try_pop() {
            self.send_waiters.notify_one();
            return Ok(value);
        }
        if self.is_closed() && self.is_empty() {
            return Err(PopError::Closed);
        }
        loop {
            self.recv_waiters
                .wait_or(|| !self.is_empty() || self.is_closed());
            if let Some(value) = self.try_pop() {
                self.send_waiters.notify_one();
                return Ok(value);
            }
            if self.is_closed() && self.is_empty() {
                return Err(PopError::Closed);
            }
        }
    }

    /// Non-parking send.
    pub fn try_send(&self, value: T) -> Result<(), PushError<T>> {
        if self.is_closed() {
            return Err(PushError::Closed(value));
        }
        match self.try_push(value) {
            Ok(()) => {
                self.recv_waiters.notify_one();
                Ok(())
            }
            Err(v) => Err(PushError::Full(v)),
        }
    }

    /// Non-parking receive.
    pub fn try_recv(&self) -> Result<T, PopError> {
        if let Some(value) = self.try_pop() {
            self.send_waiters.notify_one();
            return Ok(value);
        }
        if self.is_closed() {
            Err(PopError::Closed)
        } else {
            Err(PopError::Empty)
        }
    }

    /// Closes the channel and wakes every parked sender and receiver.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.send_waiters.notify_all();
        self.recv_waiters.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queued value count (approximate under concurrency).
    pub fn size(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            self.ring.len() - head + tail
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.next_index(self.tail.load(Ordering::Acquire)) == self.head.load(Ordering::Acquire)
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        for slot in self.ring.iter() {
            let data = slot.data.swap(ptr::null_mut(), Ordering::Relaxed);
            if !data.is_null() {
                unsafe { drop(Box::from_raw(data)) };
            }
        }
    }
}
