//! C2 — Worker pool & task queue.
//!
//! A fixed number of native-thread workers execute named, cancelable
//! tasks drawn from one in-process queue with three logical
//! priorities: ready, deferred, and in-progress (`spec.md` §4.2).
//! Scheduling is cooperative FIFO with one rule: a given node's tasks
//! are serialized on itself unless explicitly tagged
//! [`Affinity::Parallelizable`].

mod pool;
mod queue;
mod task;

pub use pool::{Pool, PoolHandle};
pub use queue::Queue;
pub use task::{Affinity, CancelToken, Outcome, Task, TaskBody, TaskKey};
