/*
 * Test Suite for the Tern Kernel
 *
 * This module contains the scenario tests that exercise the kernel state
 * machine end to end: scheduling decisions, blocking and wakeup,
 * priority inheritance, timeouts, robust-mutex recovery, message
 * ordering.
 *
 * Tests drive `Kernel` instances directly instead of the global
 * singleton: with no port installed there is no real context switch, so
 * a test plays the scheduler by making one thread "current", invoking
 * the same step functions the public API uses, and asserting on the
 * resulting states, wait lists and results.
 *
 * ## Test Modules
 *
 * - `scheduler` - thread lifecycle, switch policy, scheduler lock,
 *   signals, cancellation, forced termination
 * - `timing` - sleeps, timed waits, tick draining, software timers
 * - `mutex` - protocols, types, robustness, inheritance chains
 * - `sync` - semaphore, condition variable, event flags
 * - `messaging` - message queues and memory pools
 */

mod messaging;
mod mutex;
mod timing;

use crate::sched::kernel::Kernel;
use crate::sched::thread::ThreadId;
use crate::sched::types::{Priority, Stack, ThreadState};

/// A leaked stack region: thread stacks must outlive the test thread.
pub(crate) fn stack() -> Stack {
    Stack::new(Box::leak(vec![0u8; 256].into_boxed_slice()))
}

/// Create and activate a thread that never runs for real.
pub(crate) fn spawn(k: &mut Kernel, name: &'static str, prio: u8) -> ThreadId {
    let tid = k
        .thread_create(|_| {}, 0, name, Priority(prio), stack())
        .unwrap();
    k.activate(tid).unwrap();
    tid
}

/// A kernel with the scheduler considered started, so preemption
/// decisions are live.
pub(crate) fn booted() -> Kernel {
    let mut k = Kernel::new();
    k.started = true;
    k
}

/// Play the context switch: the previous running thread (if still
/// runnable) goes back to the ready list and `tid` occupies the running
/// slot.
pub(crate) fn switch_to(k: &mut Kernel, tid: ThreadId) {
    if let Some(cur) = k.current {
        if k.threads.get(cur.0).map(|t| t.state) == Some(ThreadState::Running) {
            if let Some(t) = k.threads.get_mut(cur.0) {
                t.state = ThreadState::Ready;
            }
            k.ready.push(&mut k.threads, cur);
        }
    }
    k.ready.remove(&mut k.threads, tid);
    if let Some(t) = k.threads.get_mut(tid.0) {
        t.state = ThreadState::Running;
    }
    k.current = Some(tid);
    k.preempt_pending = false;
}

pub(crate) fn state(k: &Kernel, tid: ThreadId) -> ThreadState {
    k.threads.get(tid.0).map(|t| t.state).unwrap()
}

pub(crate) fn prio(k: &Kernel, tid: ThreadId) -> Priority {
    k.threads.get(tid.0).map(|t| t.priority).unwrap()
}

/// Serialize tests that touch the global kernel singleton.
pub(crate) fn global_lock() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}
