/*
 * Kernel Error Codes
 *
 * Every core API returns a POSIX-aligned numeric error code. No exception
 * unwinding ever traverses the scheduler: fallible operations return
 * `Result<T>` and callers propagate with `?`.
 *
 * Two forms of contract checking are used throughout the kernel:
 * - `ensure(cond, errno)` validates caller-supplied arguments and always
 *   returns an error code, in debug and release builds alike.
 * - `debug_assert!` guards internal invariants; it panics in debug builds
 *   and compiles out in release builds.
 */

use core::fmt;

/// POSIX-aligned kernel error codes (`ok` is the absence of an error).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Errno {
    /// Operation not permitted (blocking call from handler mode,
    /// scheduler started twice, unlock by non-owner).
    EPERM = 1,

    /// Interrupted (waiter was cancelled).
    EINTR = 4,

    /// Resource temporarily unavailable (try-variant would block,
    /// recursion counter at cap).
    EAGAIN = 11,

    /// Out of memory (kernel object table exhausted).
    ENOMEM = 12,

    /// Invalid argument (out-of-range priority, null required pointer,
    /// zero-sized stack, ceiling below base).
    EINVAL = 22,

    /// Resource deadlock would occur (errorcheck mutex self-relock).
    EDEADLK = 35,

    /// Corrupted message payload.
    EBADMSG = 74,

    /// Value too large (semaphore counter cap reached).
    EOVERFLOW = 75,

    /// Message longer than the queue's slot size.
    EMSGSIZE = 90,

    /// Timed wait expired.
    ETIMEDOUT = 110,

    /// Robust mutex owner died while holding it.
    EOWNERDEAD = 130,

    /// Robust mutex was released without `consistent()`.
    ENOTRECOVERABLE = 131,
}

impl Errno {
    /// The numeric POSIX value of this error.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::EPERM => "operation not permitted",
            Errno::EINTR => "interrupted",
            Errno::EAGAIN => "resource temporarily unavailable",
            Errno::ENOMEM => "out of memory",
            Errno::EINVAL => "invalid argument",
            Errno::EDEADLK => "resource deadlock would occur",
            Errno::EBADMSG => "bad message",
            Errno::EOVERFLOW => "value too large",
            Errno::EMSGSIZE => "message too long",
            Errno::ETIMEDOUT => "timed out",
            Errno::EOWNERDEAD => "owner died",
            Errno::ENOTRECOVERABLE => "state not recoverable",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Result type used by every core API.
pub type Result<T> = core::result::Result<T, Errno>;

/// Argument/contract validation helper.
///
/// Unlike `debug_assert!`, this check is always compiled in: a violated
/// contract surfaces as an error code in release builds instead of
/// silently corrupting kernel state.
pub(crate) fn ensure(cond: bool, err: Errno) -> Result<()> {
    if cond { Ok(()) } else { Err(err) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_posix_values() {
        assert_eq!(Errno::EPERM.code(), 1);
        assert_eq!(Errno::EINVAL.code(), 22);
        assert_eq!(Errno::ETIMEDOUT.code(), 110);
        assert_eq!(Errno::EOWNERDEAD.code(), 130);
    }

    #[test]
    fn test_ensure() {
        assert_eq!(ensure(true, Errno::EINVAL), Ok(()));
        assert_eq!(ensure(false, Errno::EINVAL), Err(Errno::EINVAL));
    }
}
