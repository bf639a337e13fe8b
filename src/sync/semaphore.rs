/*
 * Counting Semaphore
 *
 * A counter with a cap and a FIFO wait list. `wait` takes a unit or
 * blocks; `post` hands the unit directly to the first waiter when one
 * exists, so the counter never goes above the cap or below zero:
 * either the count is positive, or threads are waiting.
 */

use core::fmt;

use crate::errno::{Errno, Result, ensure};
use crate::list::ListHead;
use crate::port;
use crate::sched::kernel::Kernel;
use crate::sched::thread::{SchedLinks, ThreadId};
use crate::sched::types::{Step, WaitOrder, WaitSite};
use crate::sched::with_kernel;

/// Semaphore identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemaphoreId(pub usize);

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Semaphore({})", self.0)
    }
}

/// Semaphore control block
pub struct Semaphore {
    pub id: SemaphoreId,
    pub name: &'static str,
    pub(crate) count: u32,
    pub(crate) max_count: u32,
    pub(crate) waiters: ListHead,
}

impl Kernel {
    pub(crate) fn semaphore_create(
        &mut self,
        name: &'static str,
        initial: u32,
        max_count: u32,
    ) -> Result<SemaphoreId> {
        ensure(max_count > 0 && initial <= max_count, Errno::EINVAL)?;
        let slot = self.semaphores.insert_with(|slot| Semaphore {
            id: SemaphoreId(slot),
            name,
            count: initial,
            max_count,
            waiters: ListHead::new(),
        })?;
        log::debug!("Created semaphore '{}' with ID {}", name, SemaphoreId(slot));
        Ok(SemaphoreId(slot))
    }

    pub(crate) fn semaphore_destroy(&mut self, id: SemaphoreId) -> Result<()> {
        let s = self.semaphores.get(id.0).ok_or(Errno::EINVAL)?;
        ensure(s.waiters.is_empty(), Errno::EAGAIN)?;
        self.semaphores.remove(id.0);
        Ok(())
    }

    pub(crate) fn semaphore_wait_step(
        &mut self,
        id: SemaphoreId,
        timeout: Option<u64>,
        try_only: bool,
    ) -> Result<Step<()>> {
        let caller = self.current_tid()?;
        let deadline = timeout.map(|t| self.deadline_in(t));
        let s = self.semaphores.get_mut(id.0).ok_or(Errno::EINVAL)?;

        if s.count > 0 {
            s.count -= 1;
            return Ok(Step::Ready(Ok(())));
        }
        if try_only {
            return Ok(Step::Ready(Err(Errno::EAGAIN)));
        }

        let (threads, semaphores) = (&mut self.threads, &mut self.semaphores);
        let s = semaphores.get_mut(id.0).ok_or(Errno::EINVAL)?;
        Self::wait_insert(threads, &mut s.waiters, caller, WaitOrder::Fifo);
        self.block_current(WaitSite::Semaphore(id), deadline)?;
        Ok(Step::Blocked)
    }

    /// Post one unit: direct hand-off to the first waiter, otherwise an
    /// increment bounded by the cap.
    pub(crate) fn semaphore_post_step(&mut self, id: SemaphoreId) -> Result<()> {
        let popped = {
            let s = self.semaphores.get_mut(id.0).ok_or(Errno::EINVAL)?;
            s.waiters.pop_front(&mut SchedLinks(&mut self.threads))
        };
        match popped {
            Some(slot) => {
                self.wake(ThreadId(slot), Ok(()));
                Ok(())
            }
            None => {
                let s = self.semaphores.get_mut(id.0).ok_or(Errno::EINVAL)?;
                ensure(s.count < s.max_count, Errno::EOVERFLOW)?;
                s.count += 1;
                Ok(())
            }
        }
    }
}

// ================================================================================================
// PUBLIC API
// ================================================================================================

/// Create a counting semaphore with an initial value and a cap.
pub fn create(name: &'static str, initial: u32, max_count: u32) -> Result<SemaphoreId> {
    with_kernel(|k| k.semaphore_create(name, initial, max_count))
}

/// Destroy a semaphore nobody is waiting on.
pub fn destroy(id: SemaphoreId) -> Result<()> {
    with_kernel(|k| k.semaphore_destroy(id))
}

/// Take one unit, blocking while the count is zero.
pub fn wait(id: SemaphoreId) -> Result<()> {
    wait_common(id, None, false)
}

/// Non-suspending take.
pub fn try_wait(id: SemaphoreId) -> Result<()> {
    wait_common(id, None, true)
}

/// Take bounded by a tick count.
pub fn timed_wait(id: SemaphoreId, ticks: u64) -> Result<()> {
    wait_common(id, Some(ticks), false)
}

fn wait_common(id: SemaphoreId, timeout: Option<u64>, try_only: bool) -> Result<()> {
    if !try_only {
        ensure(!port::in_handler_mode(), Errno::EPERM)?;
    }
    match with_kernel(|k| k.semaphore_wait_step(id, timeout, try_only))? {
        Step::Ready(r) => r,
        Step::Blocked => super::finish_wait(),
    }
}

/// Release one unit, waking exactly one waiter if any. Safe from ISRs.
/// `EOVERFLOW` when the count is already at its cap.
pub fn post(id: SemaphoreId) -> Result<()> {
    let r = with_kernel(|k| k.semaphore_post_step(id));
    crate::sched::preempt();
    r
}

/// Current count.
pub fn count(id: SemaphoreId) -> Result<u32> {
    with_kernel(|k| Ok(k.semaphores.get(id.0).ok_or(Errno::EINVAL)?.count))
}
