/*
 * Preemptive Priority Scheduler
 *
 * This module is the public face of the scheduler: the global kernel
 * singleton, the switch driver that talks to the port layer, and the
 * scheduling operations (start, yield, scheduler lock, preemption).
 *
 * SCHEDULING MODEL:
 * ================
 *
 * Single CPU, preemptive, priority-based. The running thread is always
 * the highest-priority ready thread; FIFO order among equal priorities
 * gives round-robin, rotated at tick boundaries and voluntary yields.
 *
 * Two orthogonal critical-section mechanisms protect kernel state:
 *
 * 1. INTERRUPT CRITICAL SECTIONS - `port::irq_disable`/`irq_restore`
 *    around every kernel-state access, because the tick ISR mutates the
 *    same structures.
 * 2. SCHEDULER LOCKS - a nestable counter (`lock`/`unlock`) that defers
 *    preemption but leaves interrupts enabled, used to bracket multi-step
 *    invariant updates.
 *
 * CONTEXT SWITCHING:
 * =================
 *
 * The switch decision is made under the kernel lock, which is released
 * before the port performs the actual switch (the incoming thread may
 * take the lock immediately). The port primitive "returns on the next
 * thread's stack"; interrupts stay disabled across it.
 */

use crate::config::{IDLE_STACK_SIZE, TICK_HZ, TIMER_STACK_SIZE};
use crate::errno::{Errno, Result, ensure};
use crate::port::{self, ThreadEntry};

pub(crate) mod kernel;
pub(crate) mod ready;
pub mod thread;
pub mod types;

pub use kernel::Kernel;
pub use thread::{ThreadId, ThreadStats};
pub use types::{Priority, Stack, ThreadState, WaitMode};

use spin::Mutex;

/// Global kernel instance
static KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);

/// Stacks for the kernel-owned service threads, and the slot the boot
/// context is saved into when the scheduler takes over.
static mut IDLE_STACK: [u8; IDLE_STACK_SIZE] = [0; IDLE_STACK_SIZE];
static mut TIMER_STACK: [u8; TIMER_STACK_SIZE] = [0; TIMER_STACK_SIZE];
static mut BOOT_SP: *mut u8 = core::ptr::null_mut();

/// Run a closure against the kernel singleton inside an interrupt
/// critical section. Fails with `EPERM` before `init`.
pub(crate) fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> Result<R>) -> Result<R> {
    port::without_interrupts(|| {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().ok_or(Errno::EPERM)?;
        f(k)
    })
}

/// Initialize the kernel tables. The single documented initialization
/// point of all process-wide state; there is no deinitialization.
pub fn init() {
    port::without_interrupts(|| {
        *KERNEL.lock() = Some(Kernel::new());
    });
    log::info!("Kernel initialized");
}

/// Start the scheduler: install the idle and timer-service threads,
/// start the tick source and enter the highest-priority ready thread.
///
/// On a real port this never returns on success. May only be called
/// once; a second call fails with `EPERM`.
pub fn start() -> Result<()> {
    ensure(!port::in_handler_mode(), Errno::EPERM)?;
    ensure(!with_kernel(|k| Ok(k.started))?, Errno::EPERM)?;

    let idle_stack =
        unsafe { Stack::from_raw((&raw mut IDLE_STACK).cast::<u8>(), IDLE_STACK_SIZE) };
    spawn_service(idle_main, 0, "idle", Priority::IDLE, idle_stack)?;

    let timer_stack =
        unsafe { Stack::from_raw((&raw mut TIMER_STACK).cast::<u8>(), TIMER_STACK_SIZE) };
    let service = spawn_service(
        crate::timer::service_main,
        0,
        "timer-service",
        Priority::ISR,
        timer_stack,
    )?;
    with_kernel(|k| {
        k.timer_service = Some(service);
        Ok(())
    })?;

    if let Some(p) = port::active() {
        p.tick_start(TICK_HZ);
    }

    let token = port::irq_save();
    let entered = {
        let mut guard = KERNEL.lock();
        guard
            .as_mut()
            .ok_or(Errno::EPERM)
            .and_then(|k| k.start_first())
    };
    let first_sp = match entered {
        Ok(sp) => sp,
        Err(e) => {
            port::irq_restore(token);
            return Err(e);
        }
    };
    if let Some(p) = port::active() {
        // Save the boot context into a scratch slot it never returns to.
        unsafe { p.context_switch(&raw mut BOOT_SP, first_sp) };
    }
    port::irq_restore(token);
    Ok(())
}

/// Voluntarily give up the CPU. Switches when another ready thread has
/// priority greater than *or equal to* the caller's, so equal-priority
/// threads make round-robin progress.
pub fn yield_now() {
    if port::in_handler_mode() {
        return;
    }
    schedule(true);
}

/// Enter a non-preemptive region, returning the previous nesting depth
/// for `unlock`. Interrupts stay enabled; only preemption is deferred.
pub fn lock() -> u32 {
    with_kernel(|k| {
        let prev = k.lock_depth;
        k.lock_depth += 1;
        Ok(prev)
    })
    .unwrap_or(0)
}

/// Restore the scheduler-lock state captured by `lock`. Leaving the
/// outermost region performs any preemption that was deferred inside it.
pub fn unlock(prev: u32) {
    let resched = with_kernel(|k| {
        k.lock_depth = prev;
        Ok(prev == 0 && k.preempt_pending)
    })
    .unwrap_or(false);
    if resched {
        schedule(false);
    }
}

/// Preemption point: switch when a ready thread outranks the running
/// one. Called at critical-section exit and after wakeups; the port's
/// tick glue calls it on the way out of the tick interrupt.
pub fn preempt() {
    if port::in_handler_mode() {
        return;
    }
    let pending = with_kernel(|k| Ok(k.preempt_pending && k.lock_depth == 0)).unwrap_or(false);
    if pending {
        schedule(false);
    }
}

/// The calling thread's ID, None during boot or from an ISR with no
/// thread context.
pub fn current_thread_id() -> Option<ThreadId> {
    with_kernel(|k| Ok(k.current)).ok().flatten()
}

/// Total context switches performed since start.
pub fn switch_count() -> u64 {
    with_kernel(|k| Ok(k.switch_count)).unwrap_or(0)
}

/// Make a switch decision and drive the port through it.
///
/// The kernel lock is dropped before the port switch: the next thread
/// resumes inside its own earlier `schedule` call and must be able to
/// take the lock at once.
pub(crate) fn schedule(allow_equal: bool) {
    let token = port::irq_save();
    let switch = {
        let mut guard = KERNEL.lock();
        match guard.as_mut() {
            Some(k) => {
                k.reap_terminated();
                k.choose_next(allow_equal)
            }
            None => None,
        }
    };
    if let Some((prev_slot, next_sp)) = switch {
        if let Some(p) = port::active() {
            unsafe { p.context_switch(prev_slot, next_sp) };
        }
    }
    port::irq_restore(token);
}

/// Creation path for the kernel-owned service threads (reserved
/// priorities allowed).
fn spawn_service(
    entry: ThreadEntry,
    arg: usize,
    name: &'static str,
    priority: Priority,
    stack: Stack,
) -> Result<ThreadId> {
    let tid = with_kernel(|k| k.thread_create_reserved(entry, arg, name, priority, stack))?;
    if let Some(p) = port::active() {
        let sp = unsafe { p.stack_init(stack.base, stack.size, thread_trampoline, tid.0) };
        with_kernel(|k| k.set_initial_sp(tid, sp))?;
    }
    with_kernel(|k| k.activate(tid))?;
    Ok(tid)
}

/// First code every thread executes: run the entry function, then exit
/// with code 0 if it returns. Keeping this between the port frame and
/// the entry function guarantees a clean termination path.
pub(crate) extern "C" fn thread_trampoline(tid: usize) -> ! {
    let dispatch = with_kernel(|k| {
        let t = k.threads.get(tid).ok_or(Errno::EINVAL)?;
        Ok((t.entry, t.arg))
    });
    if let Ok((entry, arg)) = dispatch {
        entry(arg);
    }
    thread::exit(0)
}

/// Idle thread body: the lowest-priority sentinel that runs when nothing
/// else is ready and sleeps the CPU until the next interrupt.
fn idle_main(_arg: usize) {
    loop {
        match port::active() {
            Some(p) => p.idle_sleep(),
            None => core::hint::spin_loop(),
        }
    }
}
