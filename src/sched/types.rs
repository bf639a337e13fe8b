/*
 * Scheduler Type Definitions
 *
 * This module defines the core types used throughout the scheduler
 * subsystem. These types are lightweight, Copy-able, and shared between
 * the kernel mechanism and the public API layer.
 */

use crate::config::PRIO_LEVELS;
use crate::errno::{Errno, Result, ensure};

/// Thread priority
///
/// Higher values indicate higher priority. The number of distinct levels
/// is `16 << PRIORITY_RANGE` (see `config`); three levels are reserved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Uninitialized / no priority.
    pub const NONE: Priority = Priority(0);

    /// Idle thread sentinel (lowest real level).
    pub const IDLE: Priority = Priority(1);

    /// Lowest priority available to application threads.
    pub const MIN: Priority = Priority(2);

    /// Default priority for application threads.
    pub const NORMAL: Priority = Priority((PRIO_LEVELS / 2) as u8);

    /// Highest priority available to application threads.
    pub const MAX: Priority = Priority((PRIO_LEVELS - 2) as u8);

    /// Deferred-callback (timer service) thread priority.
    pub const ISR: Priority = Priority((PRIO_LEVELS - 1) as u8);

    /// Ready-list level index for this priority.
    pub(crate) fn level(self) -> usize {
        self.0 as usize
    }

    /// Validate an application-supplied priority.
    pub(crate) fn check_app(self) -> Result<()> {
        ensure(self >= Self::MIN && self <= Self::MAX, Errno::EINVAL)
    }
}

/// Thread state
///
/// ```text
/// inactive -> ready <-> running <-> waiting -> terminated
///                          |                      ^
///                          +----------------------+
/// ```
///
/// A slot that was never created is "undefined" (no arena entry); a
/// reaped thread is "destroyed" (arena entry freed). `waiting -> ready`
/// happens from any wakeup path; `running -> waiting` only from the
/// thread itself; `running -> terminated` via exit or entry return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created but not yet made runnable.
    Inactive,
    /// On the ready list.
    Ready,
    /// Occupying the running slot.
    Running,
    /// On a wait list and/or the timed-wait list.
    Waiting,
    /// Finished; awaiting join or reap.
    Terminated,
}

impl ThreadState {
    pub const fn is_schedulable(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    pub const fn is_alive(self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

/// Ordering discipline of a wait list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOrder {
    /// First blocked, first woken.
    Fifo,
    /// Highest current priority first, FIFO among equals.
    Priority,
}

bitflags::bitflags! {
    /// How a flag wait is satisfied (thread signals and event flags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitMode: u8 {
        /// All wanted bits must be raised.
        const ALL = 0b001;
        /// Any wanted bit suffices.
        const ANY = 0b010;
        /// Consume matched bits atomically with the return.
        const CLEAR = 0b100;
    }
}

impl WaitMode {
    /// Matched bits if the wait predicate holds against `raised`, else
    /// None. A zero `wanted` mask means "any currently raised bit".
    pub(crate) fn matched(self, raised: u32, wanted: u32) -> Option<u32> {
        if wanted == 0 {
            return if raised != 0 { Some(raised) } else { None };
        }
        if self.contains(WaitMode::ALL) {
            if raised & wanted == wanted {
                Some(wanted)
            } else {
                None
            }
        } else if raised & wanted != 0 {
            Some(raised & wanted)
        } else {
            None
        }
    }
}

/// What a waiting thread is blocked on. Used by the timeout, cancel and
/// kill paths to unlink the waiter from the right list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum WaitSite {
    /// Not waiting.
    #[default]
    None,
    /// Plain sleep; only on the timed-wait list.
    Sleep,
    /// Waiting on the thread's own signal flags.
    Signals,
    /// Waiting for another thread to exit.
    Join(super::thread::ThreadId),
    Mutex(crate::sync::mutex::MutexId),
    Semaphore(crate::sync::semaphore::SemaphoreId),
    Condvar(crate::sync::condvar::CondvarId),
    EventFlags(crate::sync::event_flags::EventFlagsId),
    MqSend(crate::sync::mqueue::MqueueId),
    MqRecv(crate::sync::mqueue::MqueueId),
    Pool(crate::sync::mempool::PoolId),
}

/// Outcome of the first half of a blocking operation, evaluated inside
/// one critical section.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step<T> {
    /// Completed synchronously with this result.
    Ready(core::result::Result<T, Errno>),
    /// The caller was enqueued and marked waiting; it must reschedule and
    /// read its wait result when switched back in.
    Blocked,
}

/// Caller-supplied stack region for a thread. The kernel never allocates
/// stacks; it only records and initializes the region handed to it.
#[derive(Debug, Clone, Copy)]
pub struct Stack {
    pub(crate) base: *mut u8,
    pub(crate) size: usize,
}

impl Stack {
    /// Wrap a static buffer as a thread stack.
    pub fn new(buf: &'static mut [u8]) -> Self {
        Self {
            base: buf.as_mut_ptr(),
            size: buf.len(),
        }
    }

    /// Wrap a raw region as a thread stack.
    ///
    /// # Safety
    /// `base` must point to a writable region of `size` bytes that stays
    /// valid and unaliased for the lifetime of the thread.
    pub unsafe fn from_raw(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }
}
