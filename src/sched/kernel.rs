/*
 * Kernel State - Mechanism Layer
 *
 * This module holds the single `Kernel` structure that owns every kernel
 * table: the thread arena, the ready list, the clock, the timer arena and
 * all synchronization-object arenas. Keeping the state in one flat struct
 * breaks the thread <-> mutex <-> scheduler type cycle: cross-links are
 * slot-index IDs, never references, and every mutation happens through
 * `&mut Kernel` inside one critical section.
 *
 * This file is separated from mod.rs to make the structure clear:
 * - kernel.rs: state and the scheduling mechanism (this file)
 * - mod.rs: the global singleton, public API layer and switch driver
 *
 * The per-primitive operations live in their own modules as further
 * `impl Kernel` blocks (sync/mutex.rs, clock.rs, ...).
 */

use crate::arena::Arena;
use crate::clock::Clock;
use crate::config::{
    MAX_CONDVARS, MAX_EVENT_FLAGS, MAX_MQUEUES, MAX_MUTEXES, MAX_POOLS, MAX_SEMAPHORES, MAX_TIMERS,
};
use crate::errno::{Errno, Result, ensure};
use crate::list::ListHead;
use crate::timer::Timer;

use super::ready::ReadyQueue;
use super::thread::{SchedLinks, ThreadArena, ThreadId};
use super::types::{Priority, ThreadState, WaitOrder, WaitSite};

pub struct Kernel {
    pub(crate) threads: ThreadArena,
    pub(crate) ready: ReadyQueue,

    /// The one thread occupying the running slot.
    pub(crate) current: Option<ThreadId>,
    pub(crate) started: bool,

    /// Scheduler-lock nesting counter; preemption is deferred while > 0.
    pub(crate) lock_depth: u32,
    /// A readied thread outranks the running one; switch at the next
    /// preemption point.
    pub(crate) preempt_pending: bool,

    pub(crate) switch_count: u64,

    pub(crate) clock: Clock,

    pub(crate) timers: Arena<Timer, MAX_TIMERS>,
    /// Armed timers sorted by deadline, linked through the timer link.
    pub(crate) timer_queue: ListHead,
    /// Timers that fired, awaiting the service thread.
    pub(crate) expired_timers: heapless::Deque<usize, MAX_TIMERS>,
    pub(crate) timer_service: Option<ThreadId>,

    pub(crate) mutexes: Arena<crate::sync::mutex::Mutex, MAX_MUTEXES>,
    pub(crate) semaphores: Arena<crate::sync::semaphore::Semaphore, MAX_SEMAPHORES>,
    pub(crate) condvars: Arena<crate::sync::condvar::Condvar, MAX_CONDVARS>,
    pub(crate) event_flags: Arena<crate::sync::event_flags::EventFlags, MAX_EVENT_FLAGS>,
    pub(crate) mqueues: Arena<crate::sync::mqueue::MessageQueue, MAX_MQUEUES>,
    pub(crate) pools: Arena<crate::sync::mempool::MemoryPool, MAX_POOLS>,
}

// SAFETY: the kernel is only ever mutated under the interrupt critical
// section on a single CPU; the raw pointers it carries are thread-stack
// and transfer-scratch addresses owned by blocked threads.
unsafe impl Send for Kernel {}

impl Kernel {
    pub fn new() -> Self {
        Self {
            threads: ThreadArena::new(),
            ready: ReadyQueue::new(),
            current: None,
            started: false,
            lock_depth: 0,
            preempt_pending: false,
            switch_count: 0,
            clock: Clock::new(),
            timers: Arena::new(),
            timer_queue: ListHead::new(),
            expired_timers: heapless::Deque::new(),
            timer_service: None,
            mutexes: Arena::new(),
            semaphores: Arena::new(),
            condvars: Arena::new(),
            event_flags: Arena::new(),
            mqueues: Arena::new(),
            pools: Arena::new(),
        }
    }

    /// The calling thread's ID; `EPERM` outside thread context.
    pub(crate) fn current_tid(&self) -> Result<ThreadId> {
        self.current.ok_or(Errno::EPERM)
    }

    // ============================================================================================
    // Ready / wait transitions
    // ============================================================================================

    /// Put a thread on the ready list and note preemption when it
    /// outranks the running thread.
    pub(crate) fn make_ready(&mut self, tid: ThreadId) {
        let Some(tcb) = self.threads.get_mut(tid.0) else {
            return;
        };
        debug_assert!(tcb.state != ThreadState::Running, "readying the running thread");
        tcb.state = ThreadState::Ready;
        self.ready.push(&mut self.threads, tid);
        self.note_preempt();
    }

    /// Mark the running thread as waiting on `site`, arming a timeout
    /// when a deadline is given. The caller has already queued the thread
    /// on the primitive's wait list within the same critical section, so
    /// the block and any priority boost become visible together.
    pub(crate) fn block_current(&mut self, site: WaitSite, deadline: Option<u64>) -> Result<()> {
        let tid = self.current_tid()?;
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        debug_assert!(tcb.state == ThreadState::Running, "blocking a non-running thread");
        tcb.state = ThreadState::Waiting;
        tcb.wait_site = site;
        tcb.wait_result = Ok(());
        if let Some(d) = deadline {
            tcb.deadline = d;
            self.clock_enqueue(tid);
        }
        #[cfg(feature = "sched-trace")]
        log::trace!("block {} on {:?}", tid, site);
        Ok(())
    }

    /// Wake a waiting thread with the given result. The caller has
    /// already unlinked it from the primitive's wait list; the timed-wait
    /// entry is removed here.
    pub(crate) fn wake(&mut self, tid: ThreadId, result: Result<()>) {
        self.clock_remove(tid);
        let Some(tcb) = self.threads.get_mut(tid.0) else {
            return;
        };
        debug_assert!(tcb.state == ThreadState::Waiting, "waking a non-waiting thread");
        tcb.wait_result = result;
        tcb.wait_site = WaitSite::None;
        #[cfg(feature = "sched-trace")]
        log::trace!("wake {} with {:?}", tid, result);
        self.make_ready(tid);
    }

    /// Read and reset the wait result written by the waker.
    pub(crate) fn take_wait_result(&mut self, tid: ThreadId) -> Result<()> {
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        core::mem::replace(&mut tcb.wait_result, Ok(()))
    }

    /// Unlink a waiting thread from whatever wait list it sits on. Used
    /// by the timeout, cancel and kill paths; the wait-site record names
    /// the list.
    pub(crate) fn detach_waiter(&mut self, tid: ThreadId) {
        let Some(site) = self.threads.get(tid.0).map(|t| t.wait_site) else {
            return;
        };
        match site {
            WaitSite::None | WaitSite::Sleep | WaitSite::Signals => {}
            WaitSite::Join(target) => {
                if let Some(t) = self.threads.get_mut(target.0) {
                    t.joiner = None;
                }
            }
            WaitSite::Mutex(id) => {
                if let Some(m) = self.mutexes.get_mut(id.0) {
                    m.waiters.remove(&mut SchedLinks(&mut self.threads), tid.0);
                }
            }
            WaitSite::Semaphore(id) => {
                if let Some(s) = self.semaphores.get_mut(id.0) {
                    s.waiters.remove(&mut SchedLinks(&mut self.threads), tid.0);
                }
            }
            WaitSite::Condvar(id) => {
                if let Some(c) = self.condvars.get_mut(id.0) {
                    c.waiters.remove(&mut SchedLinks(&mut self.threads), tid.0);
                }
            }
            WaitSite::EventFlags(id) => {
                if let Some(e) = self.event_flags.get_mut(id.0) {
                    e.waiters.remove(&mut SchedLinks(&mut self.threads), tid.0);
                }
            }
            WaitSite::MqSend(id) => {
                if let Some(q) = self.mqueues.get_mut(id.0) {
                    q.senders.remove(&mut SchedLinks(&mut self.threads), tid.0);
                }
            }
            WaitSite::MqRecv(id) => {
                if let Some(q) = self.mqueues.get_mut(id.0) {
                    q.receivers.remove(&mut SchedLinks(&mut self.threads), tid.0);
                }
            }
            WaitSite::Pool(id) => {
                if let Some(p) = self.pools.get_mut(id.0) {
                    p.waiters.remove(&mut SchedLinks(&mut self.threads), tid.0);
                }
            }
        }
    }

    /// Re-insert a waiter whose priority changed into its (priority
    /// ordered) wait list. FIFO lists keep their order.
    pub(crate) fn requeue_waiter(&mut self, tid: ThreadId) {
        let Some(site) = self.threads.get(tid.0).map(|t| t.wait_site) else {
            return;
        };
        match site {
            WaitSite::Mutex(id) => {
                let Some(order) = self.mutexes.get(id.0).map(|m| m.wait_order()) else {
                    return;
                };
                if order == WaitOrder::Priority {
                    if let Some(m) = self.mutexes.get_mut(id.0) {
                        m.waiters.remove(&mut SchedLinks(&mut self.threads), tid.0);
                    }
                    // Split borrow: list lives in the mutex arena, links
                    // in the thread arena.
                    let (threads, mutexes) = (&mut self.threads, &mut self.mutexes);
                    if let Some(m) = mutexes.get_mut(id.0) {
                        Self::wait_insert(threads, &mut m.waiters, tid, WaitOrder::Priority);
                    }
                }
            }
            WaitSite::MqSend(id) => {
                let (threads, mqueues) = (&mut self.threads, &mut self.mqueues);
                if let Some(q) = mqueues.get_mut(id.0) {
                    q.senders.remove(&mut SchedLinks(&mut *threads), tid.0);
                    Self::wait_insert(threads, &mut q.senders, tid, WaitOrder::Priority);
                }
            }
            WaitSite::MqRecv(id) => {
                let (threads, mqueues) = (&mut self.threads, &mut self.mqueues);
                if let Some(q) = mqueues.get_mut(id.0) {
                    q.receivers.remove(&mut SchedLinks(&mut *threads), tid.0);
                    Self::wait_insert(threads, &mut q.receivers, tid, WaitOrder::Priority);
                }
            }
            _ => {}
        }
    }

    /// Insert a thread into a wait list with the list's ordering
    /// discipline. Priority order is descending current priority with
    /// FIFO among equals.
    pub(crate) fn wait_insert(
        threads: &mut ThreadArena,
        list: &mut ListHead,
        tid: ThreadId,
        order: WaitOrder,
    ) {
        match order {
            WaitOrder::Fifo => list.push_back(&mut SchedLinks(threads), tid.0),
            WaitOrder::Priority => {
                let Some(prio) = threads.get(tid.0).map(|t| t.priority) else {
                    return;
                };
                let mut cursor = list.head();
                while let Some(c) = cursor {
                    let cprio = threads.get(c).map(|t| t.priority).unwrap_or(Priority::NONE);
                    if cprio < prio {
                        list.insert_before(&mut SchedLinks(&mut *threads), c, tid.0);
                        return;
                    }
                    cursor = threads.get(c).and_then(|t| t.sched_link.next());
                }
                list.push_back(&mut SchedLinks(threads), tid.0);
            }
        }
    }

    // ============================================================================================
    // Priority
    // ============================================================================================

    /// Change a thread's current (effective) priority, repositioning it
    /// in the ready list or its priority-ordered wait list.
    pub(crate) fn set_current_priority(&mut self, tid: ThreadId, new: Priority) {
        let Some(tcb) = self.threads.get(tid.0) else {
            return;
        };
        if tcb.priority == new {
            return;
        }
        match tcb.state {
            ThreadState::Ready => {
                self.ready.remove(&mut self.threads, tid);
                if let Some(t) = self.threads.get_mut(tid.0) {
                    t.priority = new;
                }
                self.ready.push(&mut self.threads, tid);
            }
            ThreadState::Waiting => {
                if let Some(t) = self.threads.get_mut(tid.0) {
                    t.priority = new;
                }
                self.requeue_waiter(tid);
            }
            _ => {
                if let Some(t) = self.threads.get_mut(tid.0) {
                    t.priority = new;
                }
            }
        }
        self.note_preempt();
    }

    /// A thread's priority with no boost applied beyond what its held
    /// mutexes still justify: the maximum of its base priority, the
    /// ceilings of held protect-mutexes and the top waiter of each held
    /// inherit-mutex.
    pub(crate) fn effective_priority(&self, tid: ThreadId) -> Priority {
        let Some(tcb) = self.threads.get(tid.0) else {
            return Priority::NONE;
        };
        let mut prio = tcb.base_priority;
        for id in tcb.owned.iter() {
            if let Some(boost) = self
                .mutexes
                .get(id.0)
                .and_then(|m| m.boost_priority(&self.threads))
            {
                prio = prio.max(boost);
            }
        }
        prio
    }

    /// Record pending preemption when the top ready thread outranks the
    /// running one.
    pub(crate) fn note_preempt(&mut self) {
        if !self.started {
            return;
        }
        let Some(cur) = self.current else {
            return;
        };
        let Some(cur_prio) = self.threads.get(cur.0).map(|t| t.priority) else {
            return;
        };
        if let Some(top) = self.ready.highest() {
            if top > cur_prio {
                self.preempt_pending = true;
            }
        }
    }

    // ============================================================================================
    // Switch decision
    // ============================================================================================

    /// Decide whether to switch contexts and update kernel state
    /// accordingly. Returns the outgoing stack-pointer slot and the
    /// incoming stack pointer for the port layer, or None when the
    /// running thread keeps the CPU.
    ///
    /// `allow_equal` selects the yield policy (switch when the top ready
    /// priority is >= the running one, giving round-robin progress);
    /// preemption uses strict >.
    pub(crate) fn choose_next(&mut self, allow_equal: bool) -> Option<(*mut *mut u8, *mut u8)> {
        if !self.started {
            return None;
        }
        if self.lock_depth > 0 {
            // Inside a scheduler-locked region: defer.
            self.note_preempt();
            return None;
        }
        let cur = self.current?;
        let cur_state = self.threads.get(cur.0).map(|t| t.state)?;

        let next = match cur_state {
            ThreadState::Running => {
                let cur_prio = self.threads.get(cur.0).map(|t| t.priority)?;
                let top = self.ready.highest()?;
                let beats = if allow_equal { top >= cur_prio } else { top > cur_prio };
                if !beats {
                    self.preempt_pending = false;
                    return None;
                }
                let next = self.ready.pop_highest(&mut self.threads)?;
                // The outgoing thread stays runnable: rotate it to the
                // tail of its level.
                if let Some(t) = self.threads.get_mut(cur.0) {
                    t.state = ThreadState::Ready;
                }
                self.ready.push(&mut self.threads, cur);
                next
            }
            ThreadState::Ready => {
                // Woken again before it could switch away; it is already
                // queued. Pick the best thread, which may be itself.
                let next = self.ready.pop_highest(&mut self.threads)?;
                if next == cur {
                    if let Some(t) = self.threads.get_mut(cur.0) {
                        t.state = ThreadState::Running;
                    }
                    self.preempt_pending = false;
                    return None;
                }
                next
            }
            // Waiting or terminated: the CPU must move on.
            _ => self.ready.pop_highest(&mut self.threads)?,
        };

        let next_sp = {
            let t = self.threads.get_mut(next.0)?;
            t.state = ThreadState::Running;
            t.switches += 1;
            t.stack_ptr
        };
        self.current = Some(next);
        self.switch_count += 1;
        self.preempt_pending = false;

        let prev_slot = {
            let t = self.threads.get_mut(cur.0)?;
            &mut t.stack_ptr as *mut *mut u8
        };
        #[cfg(feature = "sched-trace")]
        log::trace!("switch {} -> {}", cur, next);
        Some((prev_slot, next_sp))
    }

    /// Enter the first thread at scheduler start. Returns its initial
    /// stack pointer for the port layer.
    pub(crate) fn start_first(&mut self) -> Result<*mut u8> {
        ensure(!self.started, Errno::EPERM)?;
        self.started = true;
        let first = self
            .ready
            .pop_highest(&mut self.threads)
            .ok_or(Errno::EINVAL)?;
        let t = self.threads.get_mut(first.0).ok_or(Errno::EINVAL)?;
        t.state = ThreadState::Running;
        t.switches += 1;
        let sp = t.stack_ptr;
        self.current = Some(first);
        log::info!("Scheduler started; entering {}", first);
        Ok(sp)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
