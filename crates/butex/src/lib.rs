//! butex: compare-and-wait on a shared 32-bit word, for lightweight tasks
//! and kernel threads on the same waiter list.
//!
//! A butex is the futex of a user-space task runtime: tasks blocked on one
//! hand their wakeup to the runtime instead of tying up a kernel thread,
//! while plain threads (and tasks degraded to pthread mode) park in the
//! kernel next to them. Deadlines ride an external timer thread and a remote
//! stop can cancel a specific task's wait; the normal wake, the timer and
//! the stopper race safely because removal is tagged per waiter.
//!
//! The handle for a butex is a raw pointer to its 32-bit value word; this is
//! the foundation higher-level synchronization (mutexes, condition
//! variables, countdown events) is built on, not an API for casual use.

#![deny(unsafe_code)]

pub mod errno;

#[allow(unsafe_code)]
mod sys;

pub mod task;

#[allow(unsafe_code)]
pub mod timer;

#[allow(unsafe_code)]
pub mod butex;

pub use crate::butex::{
    butex_add_ref_before_wake, butex_construct, butex_create, butex_destroy, butex_destruct,
    butex_remove_ref, butex_requeue, butex_wait, butex_wait_uninterruptible, butex_wake,
    butex_wake_all, butex_wake_all_and_remove_ref, butex_wake_and_remove_ref, butex_wake_except,
    stop_butex_wait, BUTEX_MEMORY_ALIGN, BUTEX_MEMORY_SIZE,
};
pub use crate::task::{TaskAttr, TaskHandle, TaskId};
