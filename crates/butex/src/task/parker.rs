//! Per-task futex parker.
//!
//! A single 32-bit word holding one wake token. `unpark` needs to
//! synchronize with the part of `park` that consumes the token, which the
//! release store of NOTIFIED and the acquire loads in `park` provide; no
//! other ordering is promised.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::{Acquire, Release};

use crate::sys;

const PARKED: i32 = -1;
const EMPTY: i32 = 0;
const NOTIFIED: i32 = 1;

pub(crate) struct Parker {
    state: AtomicI32,
}

impl Parker {
    pub(crate) const fn new() -> Self {
        Parker {
            state: AtomicI32::new(EMPTY),
        }
    }

    /// Blocks until a token is delivered. Consumes an already-present token
    /// without sleeping.
    ///
    /// Only the owning task may call this, so the state is never PARKED on
    /// entry.
    pub(crate) fn park(&self) {
        // NOTIFIED => EMPTY (consume the token) or EMPTY => PARKED.
        if self.state.fetch_sub(1, Acquire) == NOTIFIED {
            return;
        }
        loop {
            let _ = sys::futex_wait_private(&self.state, PARKED, None);
            if self
                .state
                .compare_exchange(NOTIFIED, EMPTY, Acquire, Acquire)
                .is_ok()
            {
                return;
            }
            // Spurious wakeup; the word still reads PARKED.
        }
    }

    /// Delivers the token and wakes the task if it is parked.
    ///
    /// The caller must keep the parker alive across the call (the scheduling
    /// layer holds its own task-metadata reference for exactly this reason).
    pub(crate) fn unpark(&self) {
        let state_ptr = &self.state as *const AtomicI32;
        if self.state.swap(NOTIFIED, Release) == PARKED {
            let _ = sys::futex_wake_private(state_ptr, 1);
        }
    }

    /// Delivers the token without issuing the kernel wakeup.
    ///
    /// Returns true when the task was parked, i.e. a later
    /// [`Parker::wake_parked`] is required for it to actually run. Anything
    /// touching the parked task's stack must happen before this call: once
    /// the token is visible, a spurious kernel wakeup is enough for the task
    /// to resume.
    pub(crate) fn unpark_deferred(&self) -> bool {
        self.state.swap(NOTIFIED, Release) == PARKED
    }

    /// Issues the kernel wakeup owed after [`Parker::unpark_deferred`].
    pub(crate) fn wake_parked(&self) {
        let _ = sys::futex_wake_private(&self.state, 1);
    }
}
