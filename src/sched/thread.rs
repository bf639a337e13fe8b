/*
 * Thread Management
 *
 * This module defines the thread control block and the public thread API:
 * creation, join/detach, exit, signal flags, priority changes,
 * cooperative cancellation, forced termination and cleanup handlers.
 *
 * Threads own nothing heap-allocated: the stack region is supplied by the
 * caller, and the control block lives in a fixed-capacity arena inside
 * the kernel. List links for the ready/wait lists and the timed-wait list
 * are embedded in the control block (see `list`).
 */

use core::fmt;

use crate::arena::{Arena, Slot};
use crate::config::{CLEANUP_DEPTH, MAX_OWNED_MUTEXES, MAX_THREADS};
use crate::errno::{Errno, Result, ensure};
use crate::list::{Link, LinkPool};
use crate::port::{self, ThreadEntry};
use crate::sync::mutex::MutexId;

use super::kernel::Kernel;
use super::types::{Priority, Stack, Step, ThreadState, WaitMode, WaitSite};
use super::with_kernel;

/// Thread identifier
///
/// The index of the thread's control-block slot; stable until the thread
/// is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Fill pattern written over a fresh stack for high-water tracking.
const STACK_FILL: u8 = 0x55;

/// Exit code reported for forcibly terminated threads.
const KILLED_EXIT_CODE: i32 = -1;

/// Thread control block
pub struct Thread {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,

    // Caller-supplied stack region and the saved stack pointer the port
    // layer switches through.
    pub(crate) stack_base: *mut u8,
    pub(crate) stack_size: usize,
    pub(crate) stack_ptr: *mut u8,

    pub(crate) entry: ThreadEntry,
    pub(crate) arg: usize,

    // Current priority is >= base priority; it returns to base exactly
    // when the last boosting mutex is released.
    pub(crate) base_priority: Priority,
    pub(crate) priority: Priority,

    // Ready list XOR wait list membership.
    pub(crate) sched_link: Link,
    // Timed-wait list membership; `deadline` is valid while attached.
    pub(crate) clock_link: Link,
    pub(crate) deadline: u64,

    pub(crate) wait_site: WaitSite,
    pub(crate) wait_result: Result<()>,

    // Signal flags, and the predicate shared by signal and event-flag
    // waits (a thread blocks on at most one of them at a time).
    pub(crate) sig_pending: u32,
    pub(crate) flag_wanted: u32,
    pub(crate) flag_mode: WaitMode,
    pub(crate) flag_matched: u32,

    // Message-queue transfer scratch, valid while blocked on a queue:
    // source buffer for senders, destination buffer for receivers.
    pub(crate) mq_buf: *mut u8,
    pub(crate) mq_len: usize,
    pub(crate) mq_prio: u8,

    // Memory-pool hand-off scratch.
    pub(crate) alloc_ptr: *mut u8,

    // Condvar bookkeeping: the released mutex and its saved recursion
    // count, restored on re-acquisition.
    pub(crate) cv_mutex: Option<MutexId>,
    pub(crate) cv_recursion: u16,

    // Mutexes currently held; bounds priority-boost recomputation.
    pub(crate) owned: heapless::Vec<MutexId, MAX_OWNED_MUTEXES>,

    pub(crate) detached: bool,
    pub(crate) joiner: Option<ThreadId>,
    pub(crate) exit_code: i32,
    pub(crate) cancel_pending: bool,
    pub(crate) cleanup: heapless::Vec<(fn(usize), usize), CLEANUP_DEPTH>,

    pub(crate) switches: u64,
}

// SAFETY: the raw pointers inside the control block (stack region and
// transfer scratch) are only dereferenced under the kernel critical
// section on a single CPU.
unsafe impl Send for Thread {}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
        stack: Stack,
    ) -> Self {
        Self {
            id,
            name,
            state: ThreadState::Inactive,
            stack_base: stack.base,
            stack_size: stack.size,
            // Until the port lays down an initial frame the saved stack
            // pointer is simply the top of the region.
            stack_ptr: unsafe { stack.base.add(stack.size) },
            entry,
            arg,
            base_priority: priority,
            priority,
            sched_link: Link::new(),
            clock_link: Link::new(),
            deadline: 0,
            wait_site: WaitSite::None,
            wait_result: Ok(()),
            sig_pending: 0,
            flag_wanted: 0,
            flag_mode: WaitMode::ANY,
            flag_matched: 0,
            mq_buf: core::ptr::null_mut(),
            mq_len: 0,
            mq_prio: 0,
            alloc_ptr: core::ptr::null_mut(),
            cv_mutex: None,
            cv_recursion: 0,
            owned: heapless::Vec::new(),
            detached: false,
            joiner: None,
            exit_code: 0,
            cancel_pending: false,
            cleanup: heapless::Vec::new(),
            switches: 0,
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// The thread control-block arena.
pub(crate) type ThreadArena = Arena<Thread, MAX_THREADS>;

/// Link-pool adapter for ready/wait-list membership.
pub(crate) struct SchedLinks<'a>(pub &'a mut ThreadArena);

impl LinkPool for SchedLinks<'_> {
    fn link(&self, slot: Slot) -> &Link {
        &self.0.get(slot).expect("linked thread missing").sched_link
    }
    fn link_mut(&mut self, slot: Slot) -> &mut Link {
        &mut self.0.get_mut(slot).expect("linked thread missing").sched_link
    }
}

/// Link-pool adapter for timed-wait-list membership.
pub(crate) struct ClockLinks<'a>(pub &'a mut ThreadArena);

impl LinkPool for ClockLinks<'_> {
    fn link(&self, slot: Slot) -> &Link {
        &self.0.get(slot).expect("linked thread missing").clock_link
    }
    fn link_mut(&mut self, slot: Slot) -> &mut Link {
        &mut self.0.get_mut(slot).expect("linked thread missing").clock_link
    }
}

/// Point-in-time view of one thread, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStats {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,
    pub priority: Priority,
    pub base_priority: Priority,
    pub context_switches: u64,
}

// ================================================================================================
// KERNEL MECHANISM - thread lifecycle
// ================================================================================================

impl Kernel {
    /// Allocate and initialize a control block. The thread starts in
    /// `Inactive` state; `activate` makes it runnable once the port has
    /// laid down its initial stack frame.
    pub(crate) fn thread_create(
        &mut self,
        entry: ThreadEntry,
        arg: usize,
        name: &'static str,
        priority: Priority,
        stack: Stack,
    ) -> Result<ThreadId> {
        priority.check_app()?;
        self.thread_create_reserved(entry, arg, name, priority, stack)
    }

    /// Creation path that also admits the reserved idle/ISR priorities,
    /// used for the kernel-owned service threads.
    pub(crate) fn thread_create_reserved(
        &mut self,
        entry: ThreadEntry,
        arg: usize,
        name: &'static str,
        priority: Priority,
        stack: Stack,
    ) -> Result<ThreadId> {
        ensure(!stack.base.is_null() && stack.size > 0, Errno::EINVAL)?;
        ensure(priority != Priority::NONE, Errno::EINVAL)?;

        let slot = self
            .threads
            .insert_with(|slot| Thread::new(ThreadId(slot), name, entry, arg, priority, stack))?;

        // Watermark the fresh stack for high-water tracking.
        unsafe { core::ptr::write_bytes(stack.base, STACK_FILL, stack.size) };

        log::info!("Created thread '{}' with ID {}", name, ThreadId(slot));
        Ok(ThreadId(slot))
    }

    /// Transition a freshly created thread to `Ready`.
    pub(crate) fn activate(&mut self, tid: ThreadId) -> Result<()> {
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        ensure(tcb.state == ThreadState::Inactive, Errno::EPERM)?;
        self.make_ready(tid);
        Ok(())
    }

    /// Record the initial stack pointer produced by the port layer.
    pub(crate) fn set_initial_sp(&mut self, tid: ThreadId, sp: *mut u8) -> Result<()> {
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        tcb.stack_ptr = sp;
        Ok(())
    }

    /// Terminate the current thread. Cleanup handlers must already have
    /// run (they execute in thread context, outside the kernel lock).
    pub(crate) fn thread_exit(&mut self, code: i32) -> Result<()> {
        let tid = self.current_tid()?;
        self.release_held_mutexes(tid);

        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        tcb.state = ThreadState::Terminated;
        tcb.exit_code = code;
        let joiner = tcb.joiner.take();
        log::info!("Thread {} exiting with code {}", tid, code);

        if let Some(j) = joiner {
            self.wake(j, Ok(()));
        }
        Ok(())
    }

    /// Forced termination of another thread: unlink it from whatever it
    /// is queued on, run its cleanup handlers LIFO, release its robust
    /// mutexes and mark it terminated.
    pub(crate) fn thread_kill(&mut self, tid: ThreadId) -> Result<()> {
        ensure(self.current != Some(tid), Errno::EINVAL)?;
        let state = self.threads.get(tid.0).ok_or(Errno::EINVAL)?.state;
        ensure(state.is_alive(), Errno::EINVAL)?;

        match state {
            ThreadState::Ready => {
                self.ready.remove(&mut self.threads, tid);
            }
            ThreadState::Waiting => {
                self.detach_waiter(tid);
                self.clock_remove(tid);
            }
            _ => {}
        }

        // Cleanup handlers run in the killer's context; there is no way
        // to borrow the dead thread's stack.
        let handlers = {
            let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
            core::mem::take(&mut tcb.cleanup)
        };
        for (f, arg) in handlers.iter().rev() {
            f(*arg);
        }

        self.release_held_mutexes(tid);

        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        tcb.state = ThreadState::Terminated;
        tcb.exit_code = KILLED_EXIT_CODE;
        tcb.wait_site = WaitSite::None;
        let joiner = tcb.joiner.take();
        log::warn!("Thread {} forcibly terminated", tid);

        if let Some(j) = joiner {
            self.wake(j, Ok(()));
        }
        Ok(())
    }

    /// First half of `join`: reap immediately when the target already
    /// terminated, otherwise register as the single joiner and block.
    pub(crate) fn join_step(&mut self, target: ThreadId) -> Result<Step<i32>> {
        let current = self.current_tid()?;
        ensure(target != current, Errno::EDEADLK)?;
        let tcb = self.threads.get(target.0).ok_or(Errno::EINVAL)?;
        ensure(!tcb.detached, Errno::EINVAL)?;
        ensure(tcb.joiner.is_none(), Errno::EINVAL)?;

        if tcb.state == ThreadState::Terminated {
            let code = tcb.exit_code;
            self.destroy_thread(target);
            return Ok(Step::Ready(Ok(code)));
        }

        self.threads
            .get_mut(target.0)
            .ok_or(Errno::EINVAL)?
            .joiner = Some(current);
        self.block_current(WaitSite::Join(target), None)?;
        Ok(Step::Blocked)
    }

    /// Second half of `join`, after the joiner was woken: collect the
    /// exit code and free the slot.
    pub(crate) fn join_finish(&mut self, target: ThreadId) -> Result<i32> {
        let tcb = self.threads.get(target.0).ok_or(Errno::EINVAL)?;
        debug_assert!(tcb.state == ThreadState::Terminated, "join woke early");
        let code = tcb.exit_code;
        self.destroy_thread(target);
        Ok(code)
    }

    pub(crate) fn thread_detach(&mut self, tid: ThreadId) -> Result<()> {
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        ensure(tcb.joiner.is_none(), Errno::EINVAL)?;
        if tcb.state == ThreadState::Terminated {
            self.destroy_thread(tid);
        } else {
            tcb.detached = true;
        }
        Ok(())
    }

    /// Request cooperative cancellation: raise the flag and, when the
    /// target is waiting, wake it with `EINTR`.
    pub(crate) fn thread_cancel(&mut self, tid: ThreadId) -> Result<()> {
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        ensure(tcb.state.is_alive(), Errno::EINVAL)?;
        tcb.cancel_pending = true;
        if tcb.state == ThreadState::Waiting {
            self.detach_waiter(tid);
            self.wake(tid, Err(Errno::EINTR));
        }
        Ok(())
    }

    /// Free a terminated thread's slot. Idempotent against double reap.
    pub(crate) fn destroy_thread(&mut self, tid: ThreadId) {
        if let Some(tcb) = self.threads.get(tid.0) {
            debug_assert!(tcb.state == ThreadState::Terminated, "destroying live thread");
            debug_assert!(!tcb.sched_link.is_attached(), "destroying queued thread");
            log::debug!("Destroyed thread {}", tid);
            self.threads.remove(tid.0);
        }
    }

    /// Free detached terminated threads. Runs opportunistically on the
    /// schedule path, mirroring reaping on context switch.
    pub(crate) fn reap_terminated(&mut self) {
        for slot in self.threads.occupied() {
            let tid = ThreadId(slot);
            if Some(tid) == self.current {
                continue;
            }
            let Some(tcb) = self.threads.get(slot) else {
                continue;
            };
            if tcb.state == ThreadState::Terminated && tcb.detached && tcb.joiner.is_none() {
                self.destroy_thread(tid);
            }
        }
    }

    // ============================================================================================
    // Signal flags
    // ============================================================================================

    /// Raise signal bits on a thread, waking it when its pending wait is
    /// now satisfied.
    pub(crate) fn signal_raise(&mut self, tid: ThreadId, mask: u32) -> Result<()> {
        ensure(mask != 0, Errno::EINVAL)?;
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        ensure(tcb.state.is_alive(), Errno::EINVAL)?;
        tcb.sig_pending |= mask;

        if tcb.state == ThreadState::Waiting && tcb.wait_site == WaitSite::Signals {
            if let Some(matched) = tcb.flag_mode.matched(tcb.sig_pending, tcb.flag_wanted) {
                if tcb.flag_mode.contains(WaitMode::CLEAR) {
                    tcb.sig_pending &= !matched;
                }
                tcb.flag_matched = matched;
                self.wake(tid, Ok(()));
            }
        }
        Ok(())
    }

    pub(crate) fn signal_wait_step(
        &mut self,
        mask: u32,
        mode: WaitMode,
        timeout: Option<u64>,
        try_only: bool,
    ) -> Result<Step<u32>> {
        let tid = self.current_tid()?;
        let deadline = timeout.map(|t| self.deadline_in(t));
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;

        if let Some(matched) = mode.matched(tcb.sig_pending, mask) {
            if mode.contains(WaitMode::CLEAR) {
                tcb.sig_pending &= !matched;
            }
            return Ok(Step::Ready(Ok(matched)));
        }
        if try_only {
            return Ok(Step::Ready(Err(Errno::EAGAIN)));
        }

        tcb.flag_wanted = mask;
        tcb.flag_mode = mode;
        tcb.flag_matched = 0;
        self.block_current(WaitSite::Signals, deadline)?;
        Ok(Step::Blocked)
    }

    pub(crate) fn signal_clear(&mut self, mask: u32) -> Result<u32> {
        let tid = self.current_tid()?;
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        let previous = tcb.sig_pending;
        tcb.sig_pending &= !mask;
        Ok(previous)
    }

    // ============================================================================================
    // Priority
    // ============================================================================================

    /// Change a thread's base priority. The effective priority is
    /// recomputed so active boosts are preserved.
    pub(crate) fn thread_set_priority(&mut self, tid: ThreadId, priority: Priority) -> Result<()> {
        priority.check_app()?;
        let tcb = self.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        ensure(tcb.state.is_alive(), Errno::EINVAL)?;
        tcb.base_priority = priority;
        let effective = self.effective_priority(tid);
        self.set_current_priority(tid, effective);
        Ok(())
    }

    pub(crate) fn thread_priority(&self, tid: ThreadId) -> Result<Priority> {
        Ok(self.threads.get(tid.0).ok_or(Errno::EINVAL)?.priority)
    }
}

// ================================================================================================
// PUBLIC API
// ================================================================================================

/// Spawn a new thread.
///
/// The stack region is owned by the caller and must outlive the thread.
/// The thread becomes ready immediately; when it outranks the caller the
/// scheduler switches to it at the next preemption point.
pub fn spawn(
    entry: ThreadEntry,
    arg: usize,
    name: &'static str,
    priority: Priority,
    stack: Stack,
) -> Result<ThreadId> {
    let tid = with_kernel(|k| k.thread_create(entry, arg, name, priority, stack))?;

    // Lay down the initial frame so a context switch into this thread
    // starts the trampoline. Hosted test builds have no port installed
    // and drive threads through the kernel state machine instead.
    if let Some(p) = port::active() {
        let sp = unsafe { p.stack_init(stack.base, stack.size, super::thread_trampoline, tid.0) };
        with_kernel(|k| k.set_initial_sp(tid, sp))?;
    }

    with_kernel(|k| k.activate(tid))?;
    super::preempt();
    Ok(tid)
}

/// Terminate the calling thread.
///
/// Runs cleanup handlers LIFO, releases robust mutexes, records the exit
/// code for a joiner, and never returns.
pub fn exit(code: i32) -> ! {
    // Handlers run in thread context, outside the kernel lock.
    loop {
        let handler = with_kernel(|k| {
            let tid = k.current_tid()?;
            let tcb = k.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
            Ok(tcb.cleanup.pop())
        });
        match handler {
            Ok(Some((f, arg))) => f(arg),
            _ => break,
        }
    }

    let _ = with_kernel(|k| k.thread_exit(code));
    loop {
        super::schedule(true);
        // Only reachable in hosted builds where no port performs the
        // final context switch away from this thread.
        #[cfg(test)]
        panic!("exit() resumed in hosted build");
    }
}

/// Wait for a thread to terminate and collect its exit code.
pub fn join(target: ThreadId) -> Result<i32> {
    ensure(!port::in_handler_mode(), Errno::EPERM)?;
    match with_kernel(|k| k.join_step(target))? {
        Step::Ready(r) => r,
        Step::Blocked => {
            super::schedule(true);
            with_kernel(|k| {
                let tid = k.current_tid()?;
                k.take_wait_result(tid)?;
                k.join_finish(target)
            })
        }
    }
}

/// Mark a thread as detached: its slot is reclaimed automatically when it
/// terminates, and it can no longer be joined.
pub fn detach(target: ThreadId) -> Result<()> {
    with_kernel(|k| k.thread_detach(target))
}

/// Forcibly terminate a thread.
pub fn kill(target: ThreadId) -> Result<()> {
    with_kernel(|k| k.thread_kill(target))
}

/// Request cooperative cancellation of a thread. A waiting target is
/// woken with `EINTR`; a running target observes the request at its next
/// blocking call or `test_cancel`.
pub fn cancel(target: ThreadId) -> Result<()> {
    with_kernel(|k| k.thread_cancel(target))
}

/// Cancellation checkpoint for the calling thread.
pub fn test_cancel() -> Result<()> {
    with_kernel(|k| {
        let tid = k.current_tid()?;
        let tcb = k.threads.get(tid.0).ok_or(Errno::EINVAL)?;
        ensure(!tcb.cancel_pending, Errno::EINTR)
    })
}

/// Raise signal bits on a thread.
pub fn signal_raise(target: ThreadId, mask: u32) -> Result<()> {
    with_kernel(|k| k.signal_raise(target, mask))
}

/// Wait for signal bits on the calling thread; returns the matched bits.
pub fn signal_wait(mask: u32, mode: WaitMode) -> Result<u32> {
    signal_wait_common(mask, mode, None, false)
}

/// Non-suspending form of `signal_wait`.
pub fn signal_try_wait(mask: u32, mode: WaitMode) -> Result<u32> {
    signal_wait_common(mask, mode, None, true)
}

/// `signal_wait` bounded by a tick count.
pub fn signal_timed_wait(mask: u32, mode: WaitMode, ticks: u64) -> Result<u32> {
    signal_wait_common(mask, mode, Some(ticks), false)
}

fn signal_wait_common(
    mask: u32,
    mode: WaitMode,
    timeout: Option<u64>,
    try_only: bool,
) -> Result<u32> {
    if !try_only {
        ensure(!port::in_handler_mode(), Errno::EPERM)?;
    }
    match with_kernel(|k| k.signal_wait_step(mask, mode, timeout, try_only))? {
        Step::Ready(r) => r,
        Step::Blocked => {
            super::schedule(true);
            with_kernel(|k| {
                let tid = k.current_tid()?;
                k.take_wait_result(tid)?;
                Ok(k.threads.get(tid.0).ok_or(Errno::EINVAL)?.flag_matched)
            })
        }
    }
}

/// Clear signal bits on the calling thread; returns the previous mask.
/// Clearing the same mask twice behaves identically to once.
pub fn signal_clear(mask: u32) -> Result<u32> {
    with_kernel(|k| k.signal_clear(mask))
}

/// Currently raised signal bits of the calling thread.
pub fn signal_get() -> Result<u32> {
    with_kernel(|k| {
        let tid = k.current_tid()?;
        Ok(k.threads.get(tid.0).ok_or(Errno::EINVAL)?.sig_pending)
    })
}

/// Current (possibly boosted) priority of a thread.
pub fn priority_get(target: ThreadId) -> Result<Priority> {
    with_kernel(|k| k.thread_priority(target))
}

/// Change a thread's base priority.
pub fn priority_set(target: ThreadId, priority: Priority) -> Result<()> {
    let r = with_kernel(|k| k.thread_set_priority(target, priority));
    super::preempt();
    r
}

/// Push a cleanup handler onto the calling thread's LIFO stack.
pub fn cleanup_push(handler: fn(usize), arg: usize) -> Result<()> {
    with_kernel(|k| {
        let tid = k.current_tid()?;
        let tcb = k.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        tcb.cleanup.push((handler, arg)).map_err(|_| Errno::ENOMEM)
    })
}

/// Pop the most recently pushed cleanup handler, optionally running it.
pub fn cleanup_pop(execute: bool) -> Result<()> {
    let popped = with_kernel(|k| {
        let tid = k.current_tid()?;
        let tcb = k.threads.get_mut(tid.0).ok_or(Errno::EINVAL)?;
        tcb.cleanup.pop().ok_or(Errno::EINVAL)
    })?;
    if execute {
        let (f, arg) = popped;
        f(arg);
    }
    Ok(())
}

/// Snapshot of every live thread, for diagnostics.
pub fn stats() -> heapless::Vec<ThreadStats, MAX_THREADS> {
    with_kernel(|k| {
        Ok(k.threads
            .iter()
            .map(|(_, t)| ThreadStats {
                id: t.id,
                name: t.name,
                state: t.state,
                priority: t.priority,
                base_priority: t.base_priority,
                context_switches: t.switches,
            })
            .collect())
    })
    .unwrap_or_default()
}

/// Bytes of a thread's stack that have ever been used, measured against
/// the fill pattern written at creation.
pub fn stack_high_water(target: ThreadId) -> Result<usize> {
    with_kernel(|k| {
        let tcb = k.threads.get(target.0).ok_or(Errno::EINVAL)?;
        let mut untouched = 0;
        // Stacks grow downward: unused bytes keep the pattern at the base.
        while untouched < tcb.stack_size {
            let byte = unsafe { tcb.stack_base.add(untouched).read() };
            if byte != STACK_FILL {
                break;
            }
            untouched += 1;
        }
        Ok(tcb.stack_size - untouched)
    })
}
