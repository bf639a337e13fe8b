/*
 * Event Flags
 *
 * A 32-bit mask threads can wait on with an ALL or ANY predicate and an
 * optional clear-on-consume. `raise` ORs bits in and scans the waiters
 * in queue order: every waiter whose predicate now holds is readied, and
 * in CLEAR mode its matched bits are consumed before the next waiter is
 * examined - event consumption is deterministic, first waiter first.
 */

use core::fmt;

use crate::errno::{Errno, Result, ensure};
use crate::list::ListHead;
use crate::port;
use crate::sched::kernel::Kernel;
use crate::sched::thread::{SchedLinks, ThreadId};
use crate::sched::types::{Step, WaitMode, WaitOrder, WaitSite};
use crate::sched::with_kernel;

/// Event-flags identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventFlagsId(pub usize);

impl fmt::Display for EventFlagsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventFlags({})", self.0)
    }
}

/// Event-flags control block
pub struct EventFlags {
    pub id: EventFlagsId,
    pub name: &'static str,
    pub(crate) flags: u32,
    pub(crate) waiters: ListHead,
}

impl Kernel {
    pub(crate) fn event_flags_create(&mut self, name: &'static str) -> Result<EventFlagsId> {
        let slot = self.event_flags.insert_with(|slot| EventFlags {
            id: EventFlagsId(slot),
            name,
            flags: 0,
            waiters: ListHead::new(),
        })?;
        log::debug!("Created event flags '{}' with ID {}", name, EventFlagsId(slot));
        Ok(EventFlagsId(slot))
    }

    pub(crate) fn event_flags_destroy(&mut self, id: EventFlagsId) -> Result<()> {
        let e = self.event_flags.get(id.0).ok_or(Errno::EINVAL)?;
        ensure(e.waiters.is_empty(), Errno::EAGAIN)?;
        self.event_flags.remove(id.0);
        Ok(())
    }

    pub(crate) fn event_wait_step(
        &mut self,
        id: EventFlagsId,
        wanted: u32,
        mode: WaitMode,
        timeout: Option<u64>,
        try_only: bool,
    ) -> Result<Step<u32>> {
        let caller = self.current_tid()?;
        let deadline = timeout.map(|t| self.deadline_in(t));
        let e = self.event_flags.get_mut(id.0).ok_or(Errno::EINVAL)?;

        if let Some(matched) = mode.matched(e.flags, wanted) {
            if mode.contains(WaitMode::CLEAR) {
                e.flags &= !matched;
            }
            return Ok(Step::Ready(Ok(matched)));
        }
        if try_only {
            return Ok(Step::Ready(Err(Errno::EAGAIN)));
        }

        {
            let t = self.threads.get_mut(caller.0).ok_or(Errno::EINVAL)?;
            t.flag_wanted = wanted;
            t.flag_mode = mode;
            t.flag_matched = 0;
        }
        let (threads, groups) = (&mut self.threads, &mut self.event_flags);
        let e = groups.get_mut(id.0).ok_or(Errno::EINVAL)?;
        Self::wait_insert(threads, &mut e.waiters, caller, WaitOrder::Fifo);
        self.block_current(WaitSite::EventFlags(id), deadline)?;
        Ok(Step::Blocked)
    }

    /// OR bits into the mask and wake every waiter whose predicate now
    /// holds, consuming matched bits between waiters in CLEAR mode.
    pub(crate) fn event_raise_step(&mut self, id: EventFlagsId, mask: u32) -> Result<u32> {
        ensure(mask != 0, Errno::EINVAL)?;
        {
            let e = self.event_flags.get_mut(id.0).ok_or(Errno::EINVAL)?;
            e.flags |= mask;
        }

        // Scan in queue order; removal invalidates the cursor, so the
        // successor is read first.
        let mut cursor = self.event_flags.get(id.0).and_then(|e| e.waiters.head());
        while let Some(slot) = cursor {
            cursor = self.threads.get(slot).and_then(|t| t.sched_link.next());

            let flags = self.event_flags.get(id.0).map(|e| e.flags).unwrap_or(0);
            let Some(t) = self.threads.get_mut(slot) else {
                continue;
            };
            let Some(matched) = t.flag_mode.matched(flags, t.flag_wanted) else {
                continue;
            };
            t.flag_matched = matched;
            let clear = t.flag_mode.contains(WaitMode::CLEAR);

            let (threads, groups) = (&mut self.threads, &mut self.event_flags);
            if let Some(e) = groups.get_mut(id.0) {
                e.waiters.remove(&mut SchedLinks(threads), slot);
                if clear {
                    e.flags &= !matched;
                }
            }
            self.wake(ThreadId(slot), Ok(()));
        }

        Ok(self.event_flags.get(id.0).map(|e| e.flags).unwrap_or(0))
    }

    pub(crate) fn event_clear_step(&mut self, id: EventFlagsId, mask: u32) -> Result<u32> {
        let e = self.event_flags.get_mut(id.0).ok_or(Errno::EINVAL)?;
        let previous = e.flags;
        e.flags &= !mask;
        Ok(previous)
    }
}

// ================================================================================================
// PUBLIC API
// ================================================================================================

/// Create an event-flags group with all bits clear.
pub fn create(name: &'static str) -> Result<EventFlagsId> {
    with_kernel(|k| k.event_flags_create(name))
}

/// Destroy a group nobody is waiting on.
pub fn destroy(id: EventFlagsId) -> Result<()> {
    with_kernel(|k| k.event_flags_destroy(id))
}

/// Wait until `wanted` bits are raised per `mode`; returns the matched
/// bits. A zero mask waits for any bit.
pub fn wait(id: EventFlagsId, wanted: u32, mode: WaitMode) -> Result<u32> {
    wait_common(id, wanted, mode, None, false)
}

/// Non-suspending form of `wait`.
pub fn try_wait(id: EventFlagsId, wanted: u32, mode: WaitMode) -> Result<u32> {
    wait_common(id, wanted, mode, None, true)
}

/// `wait` bounded by a tick count.
pub fn timed_wait(id: EventFlagsId, wanted: u32, mode: WaitMode, ticks: u64) -> Result<u32> {
    wait_common(id, wanted, mode, Some(ticks), false)
}

fn wait_common(
    id: EventFlagsId,
    wanted: u32,
    mode: WaitMode,
    timeout: Option<u64>,
    try_only: bool,
) -> Result<u32> {
    if !try_only {
        ensure(!port::in_handler_mode(), Errno::EPERM)?;
    }
    match with_kernel(|k| k.event_wait_step(id, wanted, mode, timeout, try_only))? {
        Step::Ready(r) => r,
        Step::Blocked => {
            super::finish_wait()?;
            with_kernel(|k| {
                let tid = k.current_tid()?;
                Ok(k.threads.get(tid.0).ok_or(Errno::EINVAL)?.flag_matched)
            })
        }
    }
}

/// Raise bits, waking satisfied waiters in queue order. Returns the mask
/// after consumption. Safe from ISRs.
pub fn raise(id: EventFlagsId, mask: u32) -> Result<u32> {
    let r = with_kernel(|k| k.event_raise_step(id, mask));
    crate::sched::preempt();
    r
}

/// Clear bits; returns the mask as it was before clearing. Clearing the
/// same mask twice behaves identically to once.
pub fn clear(id: EventFlagsId, mask: u32) -> Result<u32> {
    with_kernel(|k| k.event_clear_step(id, mask))
}

/// The current mask.
pub fn get(id: EventFlagsId) -> Result<u32> {
    with_kernel(|k| Ok(k.event_flags.get(id.0).ok_or(Errno::EINVAL)?.flags))
}
