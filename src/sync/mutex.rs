/*
 * Mutex
 *
 * Mutual exclusion with three orthogonal attribute axes:
 *
 * - TYPE: normal (self-relock deadlocks), errorcheck (self-relock is
 *   EDEADLK, unlock by a stranger is EPERM), recursive (counted relock
 *   up to 65535, then EAGAIN).
 * - PROTOCOL: none (FIFO waiters), inherit (priority-ordered waiters;
 *   the owner is boosted to its highest waiter, transitively through a
 *   chain of inherit mutexes), protect (immediate ceiling boost on
 *   acquisition; locking with a base priority above the ceiling is
 *   EINVAL).
 * - ROBUSTNESS: stalled (waiters of a dead owner stall forever) or
 *   robust (the next acquirer gets EOWNERDEAD plus tentative ownership
 *   and must call `consistent` before unlocking, otherwise the mutex
 *   becomes not-recoverable).
 *
 * Boosts are tracked per-mutex through the held-mutex list in each
 * thread control block: on unlock the owner's priority is recomputed as
 * the maximum of its base priority and what its remaining mutexes still
 * justify, so nested boosts compose and drop exactly when the last
 * boosting mutex is released.
 */

use core::fmt;

use crate::config::MUTEX_RECURSION_MAX;
use crate::errno::{Errno, Result, ensure};
use crate::list::ListHead;
use crate::port;
use crate::sched::kernel::Kernel;
use crate::sched::thread::{SchedLinks, ThreadArena, ThreadId};
use crate::sched::types::{Priority, Step, WaitOrder, WaitSite};
use crate::sched::with_kernel;

/// Mutex identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(pub usize);

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mutex({})", self.0)
    }
}

/// Relock behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    Normal,
    Errorcheck,
    Recursive,
}

/// Priority-inversion avoidance protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    None,
    Inherit,
    Protect,
}

/// Behavior when the owner terminates while holding the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Robustness {
    Stalled,
    Robust,
}

/// Robust-mutex recovery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Consistency {
    Consistent,
    OwnerDead,
    NotRecoverable,
}

/// Mutex control block
pub struct Mutex {
    pub id: MutexId,
    pub name: &'static str,
    pub(crate) owner: Option<ThreadId>,
    /// Recursion counter; 0 iff owner is none.
    pub(crate) count: u16,
    pub(crate) mutex_type: MutexType,
    pub(crate) protocol: MutexProtocol,
    pub(crate) robustness: Robustness,
    pub(crate) ceiling: Priority,
    pub(crate) consistency: Consistency,
    pub(crate) waiters: ListHead,
}

impl Mutex {
    /// Inherit and protect wake the highest-priority waiter first.
    pub(crate) fn wait_order(&self) -> WaitOrder {
        match self.protocol {
            MutexProtocol::None => WaitOrder::Fifo,
            _ => WaitOrder::Priority,
        }
    }

    /// The priority this mutex currently justifies for its owner.
    pub(crate) fn boost_priority(&self, threads: &ThreadArena) -> Option<Priority> {
        match self.protocol {
            MutexProtocol::Protect => Some(self.ceiling),
            MutexProtocol::Inherit => self
                .waiters
                .head()
                .and_then(|s| threads.get(s).map(|t| t.priority)),
            MutexProtocol::None => None,
        }
    }
}

// ================================================================================================
// KERNEL MECHANISM
// ================================================================================================

impl Kernel {
    pub(crate) fn mutex_create(
        &mut self,
        name: &'static str,
        mutex_type: MutexType,
        protocol: MutexProtocol,
        robustness: Robustness,
        ceiling: Priority,
    ) -> Result<MutexId> {
        if protocol == MutexProtocol::Protect {
            ceiling.check_app()?;
        }
        let slot = self.mutexes.insert_with(|slot| Mutex {
            id: MutexId(slot),
            name,
            owner: None,
            count: 0,
            mutex_type,
            protocol,
            robustness,
            ceiling,
            consistency: Consistency::Consistent,
            waiters: ListHead::new(),
        })?;
        log::debug!("Created mutex '{}' with ID {}", name, MutexId(slot));
        Ok(MutexId(slot))
    }

    /// Destroy an idle mutex. Fails with `EAGAIN` while owned or
    /// contended.
    pub(crate) fn mutex_destroy(&mut self, id: MutexId) -> Result<()> {
        let m = self.mutexes.get(id.0).ok_or(Errno::EINVAL)?;
        ensure(m.owner.is_none() && m.waiters.is_empty(), Errno::EAGAIN)?;
        self.mutexes.remove(id.0);
        Ok(())
    }

    pub(crate) fn mutex_lock_step(
        &mut self,
        id: MutexId,
        timeout: Option<u64>,
        try_only: bool,
    ) -> Result<Step<()>> {
        let caller = self.current_tid()?;
        let deadline = timeout.map(|t| self.deadline_in(t));

        let (owner, consistency, protocol, mutex_type, count, order) = {
            let m = self.mutexes.get(id.0).ok_or(Errno::EINVAL)?;
            (
                m.owner,
                m.consistency,
                m.protocol,
                m.mutex_type,
                m.count,
                m.wait_order(),
            )
        };

        if consistency == Consistency::NotRecoverable {
            return Ok(Step::Ready(Err(Errno::ENOTRECOVERABLE)));
        }

        // A protect ceiling below the caller's base priority can never
        // be honored.
        if protocol == MutexProtocol::Protect {
            let base = self
                .threads
                .get(caller.0)
                .map(|t| t.base_priority)
                .ok_or(Errno::EINVAL)?;
            let ceiling = self.mutexes.get(id.0).map(|m| m.ceiling).ok_or(Errno::EINVAL)?;
            if base > ceiling {
                return Ok(Step::Ready(Err(Errno::EINVAL)));
            }
        }

        if owner == Some(caller) {
            return Ok(match mutex_type {
                MutexType::Recursive => {
                    if count < MUTEX_RECURSION_MAX {
                        if let Some(m) = self.mutexes.get_mut(id.0) {
                            m.count += 1;
                        }
                        Step::Ready(Ok(()))
                    } else {
                        Step::Ready(Err(Errno::EAGAIN))
                    }
                }
                MutexType::Errorcheck => Step::Ready(Err(Errno::EDEADLK)),
                MutexType::Normal => {
                    // Self-relock of a normal mutex deadlocks: queue
                    // behind ourselves and wait for a wakeup that can
                    // only come from timeout or cancellation.
                    if try_only {
                        Step::Ready(Err(Errno::EAGAIN))
                    } else {
                        self.mutex_enqueue_waiter(id, caller, order, deadline)?;
                        Step::Blocked
                    }
                }
            });
        }

        if owner.is_none() {
            let granted = self.mutex_grant(id, caller)?;
            return Ok(Step::Ready(granted));
        }

        if try_only {
            return Ok(Step::Ready(Err(Errno::EAGAIN)));
        }

        self.mutex_enqueue_waiter(id, caller, order, deadline)?;

        // The boost and the block are in the same critical section, so
        // the scheduler sees the inherited priority before the waiter
        // ever blocks.
        if protocol == MutexProtocol::Inherit {
            if let Some(owner) = owner {
                let waiter_prio = self
                    .threads
                    .get(caller.0)
                    .map(|t| t.priority)
                    .unwrap_or(Priority::NONE);
                self.inherit_boost(owner, waiter_prio);
            }
        }
        Ok(Step::Blocked)
    }

    pub(crate) fn mutex_unlock_step(&mut self, id: MutexId) -> Result<()> {
        let caller = self.current_tid()?;
        let (owner, consistency, count) = {
            let m = self.mutexes.get(id.0).ok_or(Errno::EINVAL)?;
            (m.owner, m.consistency, m.count)
        };
        ensure(consistency != Consistency::NotRecoverable, Errno::ENOTRECOVERABLE)?;
        ensure(owner == Some(caller), Errno::EPERM)?;

        // Releasing a robust mutex without repairing it first poisons it
        // for every future user.
        if consistency == Consistency::OwnerDead {
            log::warn!("{} released without consistent(); now unrecoverable", id);
            self.mutex_drop_ownership(id, caller);
            if let Some(m) = self.mutexes.get_mut(id.0) {
                m.consistency = Consistency::NotRecoverable;
            }
            loop {
                let popped = {
                    let m = self.mutexes.get_mut(id.0).ok_or(Errno::EINVAL)?;
                    m.waiters.pop_front(&mut SchedLinks(&mut self.threads))
                };
                match popped {
                    Some(slot) => self.wake(ThreadId(slot), Err(Errno::ENOTRECOVERABLE)),
                    None => break,
                }
            }
            return Ok(());
        }

        if count > 1 {
            if let Some(m) = self.mutexes.get_mut(id.0) {
                m.count -= 1;
            }
            return Ok(());
        }

        self.mutex_drop_ownership(id, caller);
        self.mutex_pass_to_next(id, Ok(()))
    }

    /// Repair a robust mutex after an `EOWNERDEAD` acquisition.
    pub(crate) fn mutex_consistent(&mut self, id: MutexId) -> Result<()> {
        let caller = self.current_tid()?;
        let m = self.mutexes.get_mut(id.0).ok_or(Errno::EINVAL)?;
        ensure(m.robustness == Robustness::Robust, Errno::EINVAL)?;
        ensure(m.owner == Some(caller), Errno::EPERM)?;
        ensure(m.consistency == Consistency::OwnerDead, Errno::EINVAL)?;
        m.consistency = Consistency::Consistent;
        Ok(())
    }

    /// Called on thread exit and kill: robust mutexes transition to
    /// owner-dead and are handed to their next waiter; non-robust ones
    /// stay locked by the dead thread and their waiters stall.
    pub(crate) fn release_held_mutexes(&mut self, tid: ThreadId) {
        let owned = match self.threads.get_mut(tid.0) {
            Some(t) => core::mem::take(&mut t.owned),
            None => return,
        };
        for id in owned {
            let Some(m) = self.mutexes.get_mut(id.0) else {
                continue;
            };
            if m.owner != Some(tid) {
                continue;
            }
            match m.robustness {
                Robustness::Robust => {
                    m.consistency = Consistency::OwnerDead;
                    m.owner = None;
                    m.count = 0;
                    let _ = self.mutex_pass_to_next(id, Err(Errno::EOWNERDEAD));
                }
                Robustness::Stalled => {
                    log::warn!("{} held by dead {}; waiters stall", id, tid);
                }
            }
        }
    }

    /// Queue the caller on the wait list and mark it waiting.
    fn mutex_enqueue_waiter(
        &mut self,
        id: MutexId,
        caller: ThreadId,
        order: WaitOrder,
        deadline: Option<u64>,
    ) -> Result<()> {
        // The waiter will own the mutex on hand-off; make sure it can
        // track it then, not after the fact.
        let has_room = self
            .threads
            .get(caller.0)
            .map(|t| !t.owned.is_full())
            .unwrap_or(false);
        ensure(has_room, Errno::ENOMEM)?;

        let (threads, mutexes) = (&mut self.threads, &mut self.mutexes);
        let m = mutexes.get_mut(id.0).ok_or(Errno::EINVAL)?;
        Self::wait_insert(threads, &mut m.waiters, caller, order);
        self.block_current(WaitSite::Mutex(id), deadline)
    }

    /// Give an unowned mutex to a thread. Returns the result the new
    /// owner observes (`EOWNERDEAD` for a tentative robust grant).
    fn mutex_grant(&mut self, id: MutexId, tid: ThreadId) -> Result<core::result::Result<(), Errno>> {
        {
            let t = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
            t.owned.push(id).map_err(|_| Errno::ENOMEM)?;
        }
        let (protocol, ceiling, consistency) = {
            let m = self.mutexes.get_mut(id.0).ok_or(Errno::EINVAL)?;
            m.owner = Some(tid);
            m.count = 1;
            (m.protocol, m.ceiling, m.consistency)
        };
        if protocol == MutexProtocol::Protect {
            let current = self
                .threads
                .get(tid.0)
                .map(|t| t.priority)
                .unwrap_or(Priority::NONE);
            if ceiling > current {
                self.set_current_priority(tid, ceiling);
            }
        }
        Ok(if consistency == Consistency::OwnerDead {
            Err(Errno::EOWNERDEAD)
        } else {
            Ok(())
        })
    }

    /// Remove `tid`'s ownership record and let its priority fall back to
    /// whatever its base and remaining mutexes justify.
    pub(crate) fn mutex_drop_ownership(&mut self, id: MutexId, tid: ThreadId) {
        if let Some(m) = self.mutexes.get_mut(id.0) {
            m.owner = None;
            m.count = 0;
        }
        if let Some(t) = self.threads.get_mut(tid.0) {
            if let Some(pos) = t.owned.iter().position(|&o| o == id) {
                t.owned.swap_remove(pos);
            }
        }
        let effective = self.effective_priority(tid);
        self.set_current_priority(tid, effective);
    }

    /// Hand the mutex to its first waiter (highest priority under
    /// inherit/protect), waking it with `result`.
    pub(crate) fn mutex_pass_to_next(&mut self, id: MutexId, result: core::result::Result<(), Errno>) -> Result<()> {
        let popped = {
            let m = self.mutexes.get_mut(id.0).ok_or(Errno::EINVAL)?;
            m.waiters.pop_front(&mut SchedLinks(&mut self.threads))
        };
        let Some(slot) = popped else {
            return Ok(());
        };
        let next = ThreadId(slot);
        let granted = self.mutex_grant(id, next)?;
        // A grant result loses to a dead-owner hand-off.
        let woken = match (result, granted) {
            (Err(e), _) => Err(e),
            (Ok(()), g) => g,
        };
        // The new owner may still be boosted by its own waiters.
        let effective = self.effective_priority(next);
        let current = self
            .threads
            .get(next.0)
            .map(|t| t.priority)
            .unwrap_or(Priority::NONE);
        if effective > current {
            self.set_current_priority(next, effective);
        }
        self.wake(next, woken);
        Ok(())
    }

    /// Boost a mutex owner to a waiter's priority, following the chain
    /// when that owner is itself blocked on another inherit mutex. The
    /// walk is bounded by the held-mutex capacity.
    pub(crate) fn inherit_boost(&mut self, mut owner: ThreadId, prio: Priority) {
        for _ in 0..crate::config::MAX_OWNED_MUTEXES {
            let Some(t) = self.threads.get(owner.0) else {
                return;
            };
            if t.priority >= prio {
                return;
            }
            #[cfg(feature = "sync-trace")]
            log::trace!("inherit boost {} -> {:?}", owner, prio);
            self.set_current_priority(owner, prio);

            let next_owner = match self.threads.get(owner.0).map(|t| t.wait_site) {
                Some(WaitSite::Mutex(m)) => self
                    .mutexes
                    .get(m.0)
                    .filter(|cb| cb.protocol == MutexProtocol::Inherit)
                    .and_then(|cb| cb.owner),
                _ => None,
            };
            match next_owner {
                Some(n) => owner = n,
                None => return,
            }
        }
    }
}

// ================================================================================================
// PUBLIC API
// ================================================================================================

/// Create a plain mutex: no protocol, not robust.
pub fn create(name: &'static str, mutex_type: MutexType) -> Result<MutexId> {
    with_kernel(|k| {
        k.mutex_create(
            name,
            mutex_type,
            MutexProtocol::None,
            Robustness::Stalled,
            Priority::NONE,
        )
    })
}

/// Create a mutex with explicit protocol, robustness and (for the
/// protect protocol) ceiling priority.
pub fn create_with(
    name: &'static str,
    mutex_type: MutexType,
    protocol: MutexProtocol,
    robustness: Robustness,
    ceiling: Priority,
) -> Result<MutexId> {
    with_kernel(|k| k.mutex_create(name, mutex_type, protocol, robustness, ceiling))
}

/// Destroy an idle mutex.
pub fn destroy(id: MutexId) -> Result<()> {
    with_kernel(|k| k.mutex_destroy(id))
}

/// Acquire the mutex, blocking until it is available.
///
/// `EOWNERDEAD` reports a successful but tentative acquisition of a
/// robust mutex whose previous owner died: the caller holds the mutex
/// and must call `consistent` before unlocking.
pub fn lock(id: MutexId) -> Result<()> {
    lock_common(id, None, false)
}

/// Non-suspending acquisition attempt.
pub fn try_lock(id: MutexId) -> Result<()> {
    lock_common(id, None, true)
}

/// Acquisition bounded by a tick count.
pub fn timed_lock(id: MutexId, ticks: u64) -> Result<()> {
    lock_common(id, Some(ticks), false)
}

fn lock_common(id: MutexId, timeout: Option<u64>, try_only: bool) -> Result<()> {
    if !try_only {
        ensure(!port::in_handler_mode(), Errno::EPERM)?;
    }
    match with_kernel(|k| k.mutex_lock_step(id, timeout, try_only))? {
        Step::Ready(r) => r,
        Step::Blocked => super::finish_wait(),
    }
}

/// Release the mutex. Ownership passes directly to the highest-ranked
/// waiter; the caller's priority drops to whatever its base and
/// remaining mutexes justify.
pub fn unlock(id: MutexId) -> Result<()> {
    let r = with_kernel(|k| k.mutex_unlock_step(id));
    crate::sched::preempt();
    r
}

/// Mark a robust mutex consistent again after an `EOWNERDEAD`
/// acquisition.
pub fn consistent(id: MutexId) -> Result<()> {
    with_kernel(|k| k.mutex_consistent(id))
}

/// Current owner, None when unlocked.
pub fn owner(id: MutexId) -> Result<Option<ThreadId>> {
    with_kernel(|k| Ok(k.mutexes.get(id.0).ok_or(Errno::EINVAL)?.owner))
}
