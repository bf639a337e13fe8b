/*
 * Compile-Time Kernel Configuration
 *
 * All kernel tables are fixed-capacity and sized here. The kernel never
 * allocates from a heap: control blocks live in slot arenas, queues and
 * bookkeeping use `heapless` containers bounded by these constants, and
 * stacks and pool storage are supplied by the caller.
 *
 * Ports and applications that need different capacities change the
 * constants and rebuild; there is no runtime configuration surface.
 */

/// System tick frequency in Hz (one tick per millisecond by default).
pub const TICK_HZ: u32 = 1000;

/// Stack size in bytes for the application main thread created by the
/// bootstrap (`startup::run`).
pub const MAIN_STACK_SIZE: usize = 400;

/// Priority range prescaler, 0..=4. The scheduler manages
/// `16 << PRIORITY_RANGE` priority levels (16, 32, 64, 128 or 256).
pub const PRIORITY_RANGE: usize = 4;

/// Number of distinct priority levels.
pub const PRIO_LEVELS: usize = 16 << PRIORITY_RANGE;

/// Number of 16-level groups in the ready-list bitmap.
pub const PRIO_GROUPS: usize = PRIO_LEVELS / 16;

/// Maximum number of live threads (including idle and the timer service).
pub const MAX_THREADS: usize = 32;

/// Maximum number of software timers.
pub const MAX_TIMERS: usize = 16;

/// Kernel object table capacities.
pub const MAX_MUTEXES: usize = 32;
pub const MAX_SEMAPHORES: usize = 32;
pub const MAX_CONDVARS: usize = 16;
pub const MAX_EVENT_FLAGS: usize = 16;
pub const MAX_MQUEUES: usize = 8;
pub const MAX_POOLS: usize = 8;

/// Message queue maxima: slots per queue and bytes per message slot.
/// Individual queues may be created smaller than these caps.
pub const MQ_SLOTS: usize = 16;
pub const MQ_MSG_SIZE: usize = 64;

/// Mutexes a single thread may hold simultaneously (bounds the
/// priority-boost bookkeeping carried in the thread control block).
pub const MAX_OWNED_MUTEXES: usize = 8;

/// Depth of the per-thread LIFO cleanup-handler stack.
pub const CLEANUP_DEPTH: usize = 4;

/// Stack sizes for the kernel-owned service threads.
pub const IDLE_STACK_SIZE: usize = 256;
pub const TIMER_STACK_SIZE: usize = 512;

/// Recursion cap for recursive mutexes.
pub const MUTEX_RECURSION_MAX: u16 = 65535;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_range_is_consistent() {
        assert!(PRIORITY_RANGE <= 4);
        assert_eq!(PRIO_LEVELS, 16 << PRIORITY_RANGE);
        assert_eq!(PRIO_GROUPS * 16, PRIO_LEVELS);
        assert!(PRIO_LEVELS <= 256);
    }
}
