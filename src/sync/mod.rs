/*
 * Synchronization Primitives
 *
 * Mutex, semaphore, condition variable, event flags, message queue and
 * memory pool. All of them share one contract:
 *
 * - Every blocking operation has a plain, `try_` and `timed_` form. The
 *   try form is the zero-timeout case and never suspends (`EAGAIN` when
 *   it would). A timed wait that expires removes the waiter before
 *   returning `ETIMEDOUT`.
 * - Blocking entry points fail with `EPERM` in handler mode; ISRs use
 *   the non-suspending forms.
 * - Wakeups hand the resource directly to the chosen waiter inside one
 *   critical section, so a post/signal/raise that happens-before a wait
 *   either satisfies it synchronously or wakes exactly the right thread
 *   later - never both.
 *
 * Wait lists are the intrusive lists from `list`, linked through each
 * thread's scheduling link: a thread is on at most one of them at a
 * time, which is the invariant the wait-site record in the control block
 * encodes.
 */

pub mod condvar;
pub mod event_flags;
pub mod mempool;
pub mod mqueue;
pub mod mutex;
pub mod semaphore;

use crate::errno::Result;
use crate::sched::with_kernel;

/// Second half of every blocking operation: switch away, then collect
/// the result the waker (or the timeout path) wrote into the control
/// block.
pub(crate) fn finish_wait() -> Result<()> {
    crate::sched::schedule(true);
    with_kernel(|k| {
        let tid = k.current_tid()?;
        k.take_wait_result(tid)
    })
}
