/*
 * System Clock and Tick Management
 *
 * This module provides global tick accounting and the timed-wait list.
 * It is driven from the port's timer interrupt via `clock::tick()` and
 * provides the foundation for sleeps, timed waits and software timers.
 *
 * ## Description
 *
 * - **Monotonic Tick Counter**: a 64-bit count of timer periods since
 *   start. The only lock-free datum in the kernel: mirrored into an
 *   atomic so `now()` never takes the kernel lock.
 * - **Realtime Clock**: an adjustable offset on top of the monotonic
 *   counter; stepping it never disturbs armed timeouts.
 * - **Timed-Wait List**: sleeping and timed-waiting threads sorted by
 *   absolute deadline, linked through the clock link embedded in each
 *   thread control block. The tick drains expired entries and wakes them
 *   with `ETIMEDOUT` (timed waits) or success (plain sleeps).
 *
 * The tick handler runs in interrupt context: it must not block, and it
 * only reports whether preemption is warranted - the port's interrupt
 * glue performs the actual switch on the way out of the ISR.
 */

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TICK_HZ;
use crate::errno::{Errno, Result, ensure};
use crate::list::ListHead;
use crate::port;
use crate::sched::kernel::Kernel;
use crate::sched::thread::{ClockLinks, ThreadId};
use crate::sched::types::WaitSite;
use crate::sched::with_kernel;

/// Lock-free mirror of the tick counter, updated by the tick path.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Clock state owned by the kernel.
pub(crate) struct Clock {
    /// Monotonic ticks since start; authoritative copy.
    pub(crate) ticks: u64,
    /// Realtime = monotonic + offset.
    pub(crate) rt_offset: i64,
    /// Threads with an armed deadline, sorted ascending.
    pub(crate) sleepers: ListHead,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            ticks: 0,
            rt_offset: 0,
            sleepers: ListHead::new(),
        }
    }
}

impl Kernel {
    /// Insert a thread into the timed-wait list, sorted by its deadline.
    /// FIFO among equal deadlines.
    pub(crate) fn clock_enqueue(&mut self, tid: ThreadId) {
        let Some(deadline) = self.threads.get(tid.0).map(|t| t.deadline) else {
            return;
        };
        let mut cursor = self.clock.sleepers.head();
        while let Some(c) = cursor {
            let cdl = self.threads.get(c).map(|t| t.deadline).unwrap_or(u64::MAX);
            if cdl > deadline {
                self.clock
                    .sleepers
                    .insert_before(&mut ClockLinks(&mut self.threads), c, tid.0);
                return;
            }
            cursor = self.threads.get(c).and_then(|t| t.clock_link.next());
        }
        self.clock
            .sleepers
            .push_back(&mut ClockLinks(&mut self.threads), tid.0);
    }

    /// Remove a thread from the timed-wait list; no-op when absent.
    pub(crate) fn clock_remove(&mut self, tid: ThreadId) {
        self.clock
            .sleepers
            .remove(&mut ClockLinks(&mut self.threads), tid.0);
    }

    /// Absolute deadline `ticks` from now, for the timed-wait steps.
    pub(crate) fn deadline_in(&self, ticks: u64) -> u64 {
        self.clock.ticks.saturating_add(ticks)
    }

    /// Put the current thread to sleep until an absolute deadline.
    pub(crate) fn sleep_current_until(&mut self, deadline: u64) -> Result<()> {
        self.block_current(WaitSite::Sleep, Some(deadline))
    }

    /// Advance the clock by one tick and drain expired timed-wait
    /// entries. Returns true when the tick readied a thread that should
    /// preempt, or an equal-priority thread deserves its round-robin
    /// turn.
    pub(crate) fn tick(&mut self) -> bool {
        self.clock.ticks += 1;
        TICKS.store(self.clock.ticks, Ordering::Release);
        let now = self.clock.ticks;

        #[cfg(feature = "clock-trace")]
        log::trace!("tick {}", now);

        // Expired sleepers: plain sleeps complete normally, timed waits
        // are unlinked from their primitive and fail with ETIMEDOUT.
        loop {
            let Some(head) = self.clock.sleepers.head() else {
                break;
            };
            let deadline = self.threads.get(head).map(|t| t.deadline).unwrap_or(0);
            if deadline > now {
                break;
            }
            self.clock
                .sleepers
                .remove(&mut ClockLinks(&mut self.threads), head);
            let tid = ThreadId(head);
            let site = self
                .threads
                .get(head)
                .map(|t| t.wait_site)
                .unwrap_or(WaitSite::None);
            match site {
                WaitSite::Sleep => self.wake(tid, Ok(())),
                WaitSite::None => {}
                _ => {
                    self.detach_waiter(tid);
                    self.wake(tid, Err(Errno::ETIMEDOUT));
                }
            }
        }

        self.drain_timers(now);

        // Round-robin among equal priorities at the tick boundary.
        if !self.started || self.lock_depth > 0 {
            return false;
        }
        let Some(cur) = self.current else {
            return false;
        };
        let Some(cur_prio) = self.threads.get(cur.0).map(|t| t.priority) else {
            return false;
        };
        match self.ready.highest() {
            Some(top) if top >= cur_prio => {
                self.preempt_pending = true;
                true
            }
            _ => false,
        }
    }
}

/// Tick ISR hook. The port's timer interrupt calls this once per period;
/// a true return tells the interrupt glue to perform a context switch on
/// the way out (the readied work outranks the interrupted thread).
pub fn tick() -> bool {
    with_kernel(|k| Ok(k.tick())).unwrap_or(false)
}

/// Monotonic ticks since start. Lock-free.
pub fn now() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Milliseconds since start, derived from the tick count.
pub fn uptime_ms() -> u64 {
    now().saturating_mul(1000) / TICK_HZ as u64
}

/// Realtime clock: the monotonic counter plus an adjustable offset.
pub fn realtime_now() -> u64 {
    with_kernel(|k| Ok(k.clock.ticks.saturating_add_signed(k.clock.rt_offset))).unwrap_or(0)
}

/// Step the realtime clock. Armed deadlines are monotonic and are not
/// disturbed.
pub fn realtime_adjust(delta: i64) -> Result<()> {
    with_kernel(|k| {
        k.clock.rt_offset = k.clock.rt_offset.wrapping_add(delta);
        Ok(())
    })
}

/// Block the calling thread for at least `ticks` tick periods.
/// A zero count degenerates to a yield.
pub fn sleep_for(ticks: u64) -> Result<()> {
    ensure(!port::in_handler_mode(), Errno::EPERM)?;
    if ticks == 0 {
        crate::sched::yield_now();
        return Ok(());
    }
    with_kernel(|k| {
        let deadline = k.deadline_in(ticks);
        k.sleep_current_until(deadline)
    })?;
    crate::sched::schedule(true);
    with_kernel(|k| {
        let tid = k.current_tid()?;
        k.take_wait_result(tid)
    })
}

/// Block the calling thread until an absolute tick deadline. Returns
/// immediately when the deadline has already passed.
pub fn sleep_until(deadline: u64) -> Result<()> {
    ensure(!port::in_handler_mode(), Errno::EPERM)?;
    let armed = with_kernel(|k| {
        if deadline <= k.clock.ticks {
            return Ok(false);
        }
        k.sleep_current_until(deadline)?;
        Ok(true)
    })?;
    if !armed {
        return Ok(());
    }
    crate::sched::schedule(true);
    with_kernel(|k| {
        let tid = k.current_tid()?;
        k.take_wait_result(tid)
    })
}
