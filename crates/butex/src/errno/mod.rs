//! Error number definitions.
//!
//! errno-style error reporting with thread-local storage. Fallible wait
//! operations return a negative sentinel and set the indicator; wake
//! operations return a count and never touch it.

use std::cell::Cell;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Well-known errno constants (Linux values).
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ESRCH: i32 = 3;
pub const ETIMEDOUT: i32 = 110;

/// Operation would block: the compared value already differs.
pub const EWOULDBLOCK: i32 = EAGAIN;

/// The wait was cancelled by a remote stop request.
///
/// Library-specific; chosen above the kernel's errno range so it can never
/// collide with a value surfaced by a syscall.
pub const ESTOP: i32 = 144;

/// Returns the error message string for the given errno value.
///
/// Returns a static string describing the error, or a generic message for
/// unknown errnos.
pub fn strerror_message(errnum: i32) -> &'static str {
    match errnum {
        0 => "Success",
        EINTR => "Interrupted system call",
        ESRCH => "No such process",
        EAGAIN => "Resource temporarily unavailable",
        ENOMEM => "Cannot allocate memory",
        EFAULT => "Bad address",
        EBUSY => "Device or resource busy",
        EINVAL => "Invalid argument",
        ETIMEDOUT => "Connection timed out",
        ESTOP => "Task is stopping",
        _ => "Unknown error",
    }
}

/// Returns the current thread-local errno value.
pub fn get_errno() -> i32 {
    ERRNO.try_with(Cell::get).unwrap_or(0)
}

/// Sets the current thread-local errno value.
pub fn set_errno(value: i32) {
    let _ = ERRNO.try_with(|cell| cell.set(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strerror_known() {
        assert_eq!(strerror_message(EINVAL), "Invalid argument");
        assert_eq!(strerror_message(ETIMEDOUT), "Connection timed out");
        assert_eq!(strerror_message(ESTOP), "Task is stopping");
        assert_eq!(strerror_message(0), "Success");
    }

    #[test]
    fn test_strerror_unknown() {
        assert_eq!(strerror_message(9999), "Unknown error");
    }

    #[test]
    fn test_errno_roundtrip() {
        set_errno(42);
        assert_eq!(get_errno(), 42);
        set_errno(0);
        assert_eq!(get_errno(), 0);
    }

    #[test]
    fn test_wouldblock_aliases_eagain() {
        assert_eq!(EWOULDBLOCK, EAGAIN);
    }

    #[test]
    fn test_estop_outside_kernel_range() {
        // The kernel's last assigned errno is well below 140.
        assert!(ESTOP > 135);
    }
}
