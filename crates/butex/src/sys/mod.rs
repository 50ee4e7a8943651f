//! Kernel futex plumbing and spin primitives.
//!
//! Thin wrappers over the private-futex syscall plus the bounded spin-wait
//! used around windows where another thread may still hold a reference to
//! stack storage. Kernel errnos are returned raw; mapping them into the
//! thread-local indicator is the caller's business.

use std::sync::atomic::AtomicI32;
use std::time::Duration;

/// Converts a relative timeout into the timespec the futex syscall wants.
pub(crate) fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// `FUTEX_WAIT` on `addr` while it still holds `expected`.
///
/// Returns `Ok(())` on wakeup and `Err(kernel_errno)` otherwise; `EAGAIN`
/// means the word already changed, `ETIMEDOUT` that the relative timeout
/// elapsed, `EINTR` that a signal interrupted the sleep.
pub(crate) fn futex_wait_private(
    addr: &AtomicI32,
    expected: i32,
    timeout: Option<&libc::timespec>,
) -> Result<(), i32> {
    let ts_ptr = timeout.map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
    // SAFETY: `addr` is a live, aligned 32-bit word for the whole call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicI32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(last_errno())
    }
}

/// `FUTEX_WAKE` up to `nwake` waiters parked on `addr`.
///
/// Takes a raw pointer: the waking side may race the owner reclaiming the
/// word's storage, and the kernel answers `EFAULT` for a gone mapping, which
/// callers treat as "nobody left to wake".
pub(crate) fn futex_wake_private(addr: *const AtomicI32, nwake: i32) -> Result<i64, i32> {
    // SAFETY: the kernel only inspects the address; an unmapped one yields
    // EFAULT rather than a fault in this process.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            nwake,
        )
    };
    if rc >= 0 {
        Ok(rc as i64)
    } else {
        Err(last_errno())
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// CPU pause hint for spin loops.
#[inline]
pub(crate) fn cpu_relax() {
    std::hint::spin_loop();
}

/// Number of pause hints issued before each yield to the OS scheduler.
pub(crate) const SPINS_BEFORE_YIELD: u32 = 30;

/// Spins while `keep_spinning` returns true.
///
/// Issues `SPINS_BEFORE_YIELD` pause hints, then interleaves `sched_yield`
/// so a waiter on an oversubscribed machine cannot starve the thread it is
/// waiting on.
pub(crate) fn spin_wait_while<F: FnMut() -> bool>(mut keep_spinning: F) {
    let mut nops: u32 = 0;
    while keep_spinning() {
        if nops < SPINS_BEFORE_YIELD {
            nops += 1;
            cpu_relax();
        } else {
            // SAFETY: sched_yield takes no arguments and cannot fail in a
            // way that matters here.
            unsafe {
                libc::sched_yield();
            }
        }
    }
}
