/*
 * Port Layer Contract
 *
 * The kernel core is architecture-neutral. Everything that touches the CPU
 * directly - interrupt masking, stack frame layout, the context switch,
 * the system timer - is supplied by the platform through the `Port` trait
 * and installed once at startup.
 *
 * The context switch is inherently non-local control flow. It is treated
 * as an opaque primitive with the contract "returns on the next thread's
 * stack": the kernel computes what to switch to, releases its internal
 * lock, and hands two stack pointers to the port with interrupts disabled.
 */

use spin::Mutex;

/// Thread entry function type: receives the argument given at creation.
pub type ThreadEntry = fn(usize);

/// Trampoline signature handed to `Port::stack_init`. The kernel passes
/// its own trampoline here; ports never call thread entry functions
/// directly.
pub type EntryTrampoline = extern "C" fn(usize) -> !;

/// The narrow interface the platform layer must provide.
pub trait Port: Sync {
    /// Disable interrupts, returning an opaque token holding the previous
    /// state for `irq_restore`.
    fn irq_disable(&self) -> usize;

    /// Restore the interrupt state captured by `irq_disable`.
    fn irq_restore(&self, token: usize);

    /// True while an interrupt service routine is running. Blocking kernel
    /// calls fail with `EPERM` when this returns true.
    fn in_handler_mode(&self) -> bool;

    /// Lay down an initial frame on `[base, base+size)` so that a context
    /// switch into the returned stack pointer starts executing
    /// `trampoline(arg)` with interrupts enabled.
    ///
    /// # Safety
    /// `base` must point to a writable region of at least `size` bytes that
    /// stays valid for the lifetime of the thread.
    unsafe fn stack_init(
        &self,
        base: *mut u8,
        size: usize,
        trampoline: EntryTrampoline,
        arg: usize,
    ) -> *mut u8;

    /// Save the outgoing register state, storing the outgoing stack
    /// pointer through `prev_sp`, and resume execution from `next_sp`.
    /// Callable only with interrupts disabled. Returns when this context
    /// is switched back in.
    ///
    /// # Safety
    /// `prev_sp` must point to the outgoing thread's stack-pointer slot
    /// and `next_sp` must be a value previously produced by `stack_init`
    /// or by an earlier save through `prev_sp`.
    unsafe fn context_switch(&self, prev_sp: *mut *mut u8, next_sp: *mut u8);

    /// Program the system timer to deliver `clock::tick()` at `hz`.
    fn tick_start(&self, hz: u32);

    /// Stop the system timer.
    fn tick_stop(&self);

    /// Wait-for-interrupt hook used by the idle thread.
    fn idle_sleep(&self);

    /// Report the program exit status to the host (semihosting-style) and
    /// never return. Used by the bootstrap when `os_main` returns.
    fn terminate(&self, status: i32) -> !;
}

/// The installed platform port. Written once during startup; read on
/// every critical-section entry.
static PORT: Mutex<Option<&'static dyn Port>> = Mutex::new(None);

/// Install the platform port. Must be called before the scheduler starts.
pub fn install(port: &'static dyn Port) {
    *PORT.lock() = Some(port);
    log::info!("Port layer installed");
}

/// Get the installed port, if any.
pub(crate) fn active() -> Option<&'static dyn Port> {
    *PORT.lock()
}

/// Enter an interrupt critical section. A no-op token is returned when no
/// port is installed (hosted test builds).
pub(crate) fn irq_save() -> usize {
    match active() {
        Some(p) => p.irq_disable(),
        None => 0,
    }
}

/// Leave an interrupt critical section.
pub(crate) fn irq_restore(token: usize) {
    if let Some(p) = active() {
        p.irq_restore(token);
    }
}

/// True when the CPU is running an interrupt service routine.
pub fn in_handler_mode() -> bool {
    active().map(|p| p.in_handler_mode()).unwrap_or(false)
}

/// Run `f` with interrupts disabled.
pub(crate) fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let token = irq_save();
    let result = f();
    irq_restore(token);
    result
}
