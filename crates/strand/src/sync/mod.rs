//! Fiber-aware synchronization primitives.
//!
//! Everything here parks fibers, never OS threads. The lock-free [`Queue`]
//! is the shared substrate; [`WaitQueue`] layers fiber parking on top of it,
//! and the higher primitives compose the two.

pub mod channel;
pub mod condition;
pub mod mutex;
pub mod queue;
pub mod spin;
pub mod wait_group;
pub mod wait_queue;

pub use channel::Channel;
pub use condition::Condition;
pub use mutex::Mutex;
pub use queue::Queue;
pub use spin::SpinLock;
pub use wait_group::WaitGroup;
pub use wait_queue::WaitQueue;
