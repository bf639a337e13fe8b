/*
 * Condition Variable
 *
 * A FIFO wait list bound to a mutex at each wait. `wait` releases the
 * mutex and blocks atomically; the woken thread owns the mutex again
 * before `wait` returns, on every path including timeout.
 *
 * `signal` wakes the single highest-priority waiter. `broadcast` moves
 * the remaining waiters straight onto the mutex's wait list while the
 * mutex is held (wait-morphing): they are handed the mutex one unlock at
 * a time instead of stampeding the ready list just to block again.
 */

use core::fmt;

use crate::errno::{Errno, Result, ensure};
use crate::list::ListHead;
use crate::port;
use crate::sched::kernel::Kernel;
use crate::sched::thread::{SchedLinks, ThreadId};
use crate::sched::types::{Priority, Step, WaitOrder, WaitSite};
use crate::sched::with_kernel;

use super::mutex::{MutexId, MutexProtocol};

/// Condition variable identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CondvarId(pub usize);

impl fmt::Display for CondvarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condvar({})", self.0)
    }
}

/// Condition variable control block: a wait list and nothing else. Each
/// waiter records the mutex it released in its own control block.
pub struct Condvar {
    pub id: CondvarId,
    pub name: &'static str,
    pub(crate) waiters: ListHead,
}

impl Kernel {
    pub(crate) fn condvar_create(&mut self, name: &'static str) -> Result<CondvarId> {
        let slot = self.condvars.insert_with(|slot| Condvar {
            id: CondvarId(slot),
            name,
            waiters: ListHead::new(),
        })?;
        log::debug!("Created condvar '{}' with ID {}", name, CondvarId(slot));
        Ok(CondvarId(slot))
    }

    pub(crate) fn condvar_destroy(&mut self, id: CondvarId) -> Result<()> {
        let c = self.condvars.get(id.0).ok_or(Errno::EINVAL)?;
        ensure(c.waiters.is_empty(), Errno::EAGAIN)?;
        self.condvars.remove(id.0);
        Ok(())
    }

    /// Atomically release the mutex and enqueue the caller: both happen
    /// in this one critical section, so a signal that follows the
    /// release cannot slip past the enqueue.
    pub(crate) fn condvar_wait_step(
        &mut self,
        id: CondvarId,
        mutex: MutexId,
        timeout: Option<u64>,
    ) -> Result<Step<()>> {
        let caller = self.current_tid()?;
        let deadline = timeout.map(|t| self.deadline_in(t));
        ensure(self.condvars.get(id.0).is_some(), Errno::EINVAL)?;

        let (owner, count) = {
            let m = self.mutexes.get(mutex.0).ok_or(Errno::EINVAL)?;
            (m.owner, m.count)
        };
        ensure(owner == Some(caller), Errno::EPERM)?;

        // Remember how deep the recursive lock was; restored after
        // re-acquisition.
        {
            let t = self.threads.get_mut(caller.0).ok_or(Errno::EINVAL)?;
            t.cv_mutex = Some(mutex);
            t.cv_recursion = count;
        }

        // Full release regardless of recursion depth.
        self.mutex_drop_ownership(mutex, caller);
        self.mutex_pass_to_next(mutex, Ok(()))?;

        let (threads, condvars) = (&mut self.threads, &mut self.condvars);
        let c = condvars.get_mut(id.0).ok_or(Errno::EINVAL)?;
        Self::wait_insert(threads, &mut c.waiters, caller, WaitOrder::Fifo);
        self.block_current(WaitSite::Condvar(id), deadline)?;
        Ok(Step::Blocked)
    }

    /// Wake the highest-priority waiter; it re-acquires its mutex on the
    /// way out of `wait`.
    pub(crate) fn condvar_signal_step(&mut self, id: CondvarId) -> Result<()> {
        ensure(self.condvars.get(id.0).is_some(), Errno::EINVAL)?;
        let Some(best) = self.condvar_best_waiter(id) else {
            return Ok(());
        };
        if let Some(c) = self.condvars.get_mut(id.0) {
            c.waiters.remove(&mut SchedLinks(&mut self.threads), best.0);
        }
        self.wake(best, Ok(()));
        Ok(())
    }

    /// Wake every waiter. Waiters whose mutex is currently held are
    /// transferred to that mutex's wait list instead of the ready list.
    pub(crate) fn condvar_broadcast_step(&mut self, id: CondvarId) -> Result<()> {
        ensure(self.condvars.get(id.0).is_some(), Errno::EINVAL)?;
        loop {
            let popped = {
                let c = self.condvars.get_mut(id.0).ok_or(Errno::EINVAL)?;
                c.waiters.pop_front(&mut SchedLinks(&mut self.threads))
            };
            let Some(slot) = popped else {
                return Ok(());
            };
            let tid = ThreadId(slot);
            let mutex = self.threads.get(slot).and_then(|t| t.cv_mutex);

            let morph_target = mutex.filter(|m| {
                self.mutexes
                    .get(m.0)
                    .map(|cb| cb.owner.is_some())
                    .unwrap_or(false)
            });

            match morph_target {
                Some(m) => {
                    // Wait-morphing: requeue on the mutex without waking.
                    let order = self
                        .mutexes
                        .get(m.0)
                        .map(|cb| cb.wait_order())
                        .unwrap_or(WaitOrder::Fifo);
                    {
                        let (threads, mutexes) = (&mut self.threads, &mut self.mutexes);
                        let cb = mutexes.get_mut(m.0).ok_or(Errno::EINVAL)?;
                        Self::wait_insert(threads, &mut cb.waiters, tid, order);
                    }
                    if let Some(t) = self.threads.get_mut(slot) {
                        t.wait_site = WaitSite::Mutex(m);
                    }
                    // The transferred waiter boosts an inherit owner
                    // exactly as a direct lock attempt would.
                    let boost = {
                        let cb = self.mutexes.get(m.0).ok_or(Errno::EINVAL)?;
                        (cb.protocol == MutexProtocol::Inherit).then_some(cb.owner).flatten()
                    };
                    if let Some(owner) = boost {
                        let prio = self
                            .threads
                            .get(slot)
                            .map(|t| t.priority)
                            .unwrap_or(Priority::NONE);
                        self.inherit_boost(owner, prio);
                    }
                }
                None => self.wake(tid, Ok(())),
            }
        }
    }

    /// Highest-priority waiter in FIFO order (first among equals).
    fn condvar_best_waiter(&self, id: CondvarId) -> Option<ThreadId> {
        let c = self.condvars.get(id.0)?;
        let mut best: Option<(ThreadId, Priority)> = None;
        let mut cursor = c.waiters.head();
        while let Some(slot) = cursor {
            let t = self.threads.get(slot)?;
            if best.map(|(_, p)| t.priority > p).unwrap_or(true) {
                best = Some((ThreadId(slot), t.priority));
            }
            cursor = t.sched_link.next();
        }
        best.map(|(tid, _)| tid)
    }
}

// ================================================================================================
// PUBLIC API
// ================================================================================================

/// Create a condition variable.
pub fn create(name: &'static str) -> Result<CondvarId> {
    with_kernel(|k| k.condvar_create(name))
}

/// Destroy a condition variable nobody is waiting on.
pub fn destroy(id: CondvarId) -> Result<()> {
    with_kernel(|k| k.condvar_destroy(id))
}

/// Release `mutex` and block until signalled; the mutex is owned again
/// when this returns, including on timeout and cancellation.
pub fn wait(id: CondvarId, mutex: MutexId) -> Result<()> {
    wait_common(id, mutex, None)
}

/// `wait` bounded by a tick count.
pub fn timed_wait(id: CondvarId, mutex: MutexId, ticks: u64) -> Result<()> {
    wait_common(id, mutex, Some(ticks))
}

fn wait_common(id: CondvarId, mutex: MutexId, timeout: Option<u64>) -> Result<()> {
    ensure(!port::in_handler_mode(), Errno::EPERM)?;
    match with_kernel(|k| k.condvar_wait_step(id, mutex, timeout))? {
        Step::Ready(r) => r,
        Step::Blocked => {
            crate::sched::schedule(true);
            let (waited, recursion) = with_kernel(|k| {
                let tid = k.current_tid()?;
                let waited = k.take_wait_result(tid);
                let t = k.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
                t.cv_mutex = None;
                Ok((waited, t.cv_recursion))
            })?;

            // Re-acquire unless a morphing hand-off already made us the
            // owner while we slept.
            let owns = with_kernel(|k| {
                let tid = k.current_tid()?;
                Ok(k.mutexes.get(mutex.0).ok_or(Errno::EINVAL)?.owner == Some(tid))
            })?;
            let lock_result = if owns { Ok(()) } else { super::mutex::lock(mutex) };

            // Restore the recursion depth the caller released. EOWNERDEAD
            // still means the mutex is held.
            let holds = matches!(lock_result, Ok(()) | Err(Errno::EOWNERDEAD));
            if holds && recursion > 1 {
                with_kernel(|k| {
                    if let Some(m) = k.mutexes.get_mut(mutex.0) {
                        m.count = recursion;
                    }
                    Ok(())
                })?;
            }

            // A timeout or cancellation outranks a clean re-acquisition;
            // a robust-mutex EOWNERDEAD must not be swallowed either.
            match (waited, lock_result) {
                (Err(e), _) => Err(e),
                (Ok(()), r) => r,
            }
        }
    }
}

/// Wake the highest-priority waiter, if any.
pub fn signal(id: CondvarId) -> Result<()> {
    let r = with_kernel(|k| k.condvar_signal_step(id));
    crate::sched::preempt();
    r
}

/// Wake all waiters, morphing them onto their mutex's wait list while it
/// is held.
pub fn broadcast(id: CondvarId) -> Result<()> {
    let r = with_kernel(|k| k.condvar_broadcast_step(id));
    crate::sched::preempt();
    r
}
