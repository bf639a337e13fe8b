/*
 * Software Timers
 *
 * One-shot and periodic timers driven by the system tick. A timer owns a
 * callback, a period and a type; `start` arms it `period` ticks from
 * now, and periodic timers re-arm at `previous_deadline + period` so
 * they do not drift.
 *
 * Callbacks never run in interrupt context: the tick path only moves
 * expired timers onto a hand-off queue and signals the dedicated
 * timer-service thread, which runs at the reserved highest priority and
 * invokes the callbacks with the kernel unlocked. Callbacks may
 * therefore use the normal kernel API (except blocking indefinitely,
 * which would starve later timers).
 */

use core::fmt;

use crate::arena::Slot;
use crate::errno::{Errno, Result, ensure};
use crate::list::{Link, LinkPool};
use crate::sched::kernel::Kernel;
use crate::sched::types::WaitMode;
use crate::sched::with_kernel;

/// Timer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub usize);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timer({})", self.0)
    }
}

/// Timer behavior after expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Fire once, then disarm.
    OneShot,
    /// Re-arm at `previous_deadline + period` after every expiry.
    Periodic,
}

/// Signal bit used to wake the timer-service thread.
pub(crate) const SERVICE_SIGNAL: u32 = 0x1;

/// Timer control block
pub struct Timer {
    pub id: TimerId,
    pub name: &'static str,
    pub(crate) callback: fn(usize),
    pub(crate) arg: usize,
    pub(crate) period: u64,
    pub(crate) timer_type: TimerType,
    /// Membership in the armed-timer queue.
    pub(crate) link: Link,
    pub(crate) deadline: u64,
    /// Cleared by `stop`; checked again before the callback runs so a
    /// stop between expiry and dispatch wins.
    pub(crate) active: bool,
}

/// Link-pool adapter for the armed-timer queue.
pub(crate) struct TimerLinks<'a>(pub &'a mut crate::arena::Arena<Timer, { crate::config::MAX_TIMERS }>);

impl LinkPool for TimerLinks<'_> {
    fn link(&self, slot: Slot) -> &Link {
        &self.0.get(slot).expect("linked timer missing").link
    }
    fn link_mut(&mut self, slot: Slot) -> &mut Link {
        &mut self.0.get_mut(slot).expect("linked timer missing").link
    }
}

impl Kernel {
    pub(crate) fn timer_create(
        &mut self,
        name: &'static str,
        callback: fn(usize),
        arg: usize,
        timer_type: TimerType,
        period: u64,
    ) -> Result<TimerId> {
        ensure(period > 0, Errno::EINVAL)?;
        let slot = self.timers.insert_with(|slot| Timer {
            id: TimerId(slot),
            name,
            callback,
            arg,
            period,
            timer_type,
            link: Link::new(),
            deadline: 0,
            active: false,
        })?;
        log::debug!("Created timer '{}' with ID {}", name, TimerId(slot));
        Ok(TimerId(slot))
    }

    /// Arm a timer `period` ticks from now. Restarting an armed timer
    /// re-bases its deadline.
    pub(crate) fn timer_start(&mut self, id: TimerId) -> Result<()> {
        let now = self.clock.ticks;
        let deadline = {
            let t = self.timers.get_mut(id.0).ok_or(Errno::EINVAL)?;
            t.active = true;
            t.deadline = now.saturating_add(t.period);
            t.deadline
        };
        self.timer_queue.remove(&mut TimerLinks(&mut self.timers), id.0);
        self.timer_enqueue(id, deadline);
        #[cfg(feature = "timer-trace")]
        log::trace!("armed {} for tick {}", id, deadline);
        Ok(())
    }

    /// Disarm a timer. An expiry already handed to the service thread is
    /// suppressed before its callback runs.
    pub(crate) fn timer_stop(&mut self, id: TimerId) -> Result<()> {
        let t = self.timers.get_mut(id.0).ok_or(Errno::EINVAL)?;
        t.active = false;
        self.timer_queue.remove(&mut TimerLinks(&mut self.timers), id.0);
        Ok(())
    }

    pub(crate) fn timer_destroy(&mut self, id: TimerId) -> Result<()> {
        ensure(self.timers.get(id.0).is_some(), Errno::EINVAL)?;
        self.timer_queue.remove(&mut TimerLinks(&mut self.timers), id.0);
        self.timers.remove(id.0);
        Ok(())
    }

    fn timer_enqueue(&mut self, id: TimerId, deadline: u64) {
        let mut cursor = self.timer_queue.head();
        while let Some(c) = cursor {
            let cdl = self.timers.get(c).map(|t| t.deadline).unwrap_or(u64::MAX);
            if cdl > deadline {
                self.timer_queue
                    .insert_before(&mut TimerLinks(&mut self.timers), c, id.0);
                return;
            }
            cursor = self.timers.get(c).and_then(|t| t.link.next());
        }
        self.timer_queue
            .push_back(&mut TimerLinks(&mut self.timers), id.0);
    }

    /// Move expired timers to the service hand-off queue, re-arming
    /// periodic ones, and signal the service thread. Runs on the tick.
    pub(crate) fn drain_timers(&mut self, now: u64) {
        let mut fired = false;
        loop {
            let Some(head) = self.timer_queue.head() else {
                break;
            };
            let deadline = self.timers.get(head).map(|t| t.deadline).unwrap_or(u64::MAX);
            if deadline > now {
                break;
            }
            self.timer_queue.remove(&mut TimerLinks(&mut self.timers), head);
            if self.expired_timers.push_back(head).is_ok() {
                fired = true;
            }

            // Drift-free re-arm for periodic timers. A deadline that is
            // already in the past (ticks were missed under overload) is
            // re-based off `now` instead of firing back-to-back.
            let rearm = {
                let Some(t) = self.timers.get_mut(head) else {
                    continue;
                };
                match t.timer_type {
                    TimerType::Periodic => {
                        t.deadline = t.deadline.saturating_add(t.period);
                        if t.deadline <= now {
                            t.deadline = now.saturating_add(t.period);
                        }
                        Some(t.deadline)
                    }
                    TimerType::OneShot => None,
                }
            };
            if let Some(dl) = rearm {
                self.timer_enqueue(TimerId(head), dl);
            }
        }

        if fired {
            if let Some(service) = self.timer_service {
                let _ = self.signal_raise(service, SERVICE_SIGNAL);
            }
        }
    }

    /// Pop the next expired callback for the service thread, skipping
    /// timers stopped (or destroyed) after expiry.
    pub(crate) fn take_expired(&mut self) -> Option<(fn(usize), usize)> {
        while let Some(slot) = self.expired_timers.pop_front() {
            if let Some(t) = self.timers.get_mut(slot) {
                if !t.active {
                    continue;
                }
                if t.timer_type == TimerType::OneShot {
                    t.active = false;
                }
                return Some((t.callback, t.arg));
            }
        }
        None
    }
}

/// Body of the dedicated deferred-callback thread. Created by
/// `sched::start` at the reserved `Priority::ISR` level.
pub(crate) fn service_main(_arg: usize) {
    loop {
        let _ = crate::sched::thread::signal_wait(SERVICE_SIGNAL, WaitMode::ANY | WaitMode::CLEAR);
        while let Some((callback, arg)) = with_kernel(|k| Ok(k.take_expired())).unwrap_or(None) {
            callback(arg);
        }
    }
}

// ================================================================================================
// PUBLIC API
// ================================================================================================

/// Create a timer with a callback, argument, type and period in ticks.
pub fn create(
    name: &'static str,
    callback: fn(usize),
    arg: usize,
    timer_type: TimerType,
    period: u64,
) -> Result<TimerId> {
    with_kernel(|k| k.timer_create(name, callback, arg, timer_type, period))
}

/// Arm a timer to fire `period` ticks from now.
pub fn start(id: TimerId) -> Result<()> {
    with_kernel(|k| k.timer_start(id))
}

/// Disarm a timer.
pub fn stop(id: TimerId) -> Result<()> {
    with_kernel(|k| k.timer_stop(id))
}

/// Destroy a timer, disarming it first.
pub fn destroy(id: TimerId) -> Result<()> {
    with_kernel(|k| k.timer_destroy(id))
}

/// True while a timer is armed or awaiting its callback.
pub fn is_active(id: TimerId) -> Result<bool> {
    with_kernel(|k| Ok(k.timers.get(id.0).ok_or(Errno::EINVAL)?.active))
}
