//! The butex: compare-and-wait on a shared 32-bit word.
//!
//! Essence of futex-like semantics is sequenced wait and wake operations
//! and guaranteed visibility.
//!
//! If wait is sequenced before wake:
//!
//! ```text
//! thread1               thread2
//! -------               -------
//! wait()                value = new_value
//!                       wake()
//! ```
//!
//! wait() sees the unmatched value (fails to wait), or wake() sees the
//! waiter.
//!
//! If wait is sequenced after wake:
//!
//! ```text
//! thread1               thread2
//! -------               -------
//!                       value = new_value
//!                       wake()
//! wait()
//! ```
//!
//! wake() provides the fencing that keeps the value assignment from being
//! reordered after it, so the value is visible to wait() as well.
//!
//! A handle is a `*mut AtomicI32` pointing at the first field of a [`Butex`]
//! record; waiters are stack records linked into the butex under a short
//! lock. Task waiters give their wakeup to the task runtime, thread waiters
//! to the kernel futex on their own signal word.

mod list;

use std::alloc::{alloc, dealloc, Layout};
use std::ffi::c_int;
use std::mem::offset_of;
use std::ptr;
use std::sync::atomic::{
    fence, AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicU8, Ordering,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::errno::{self, ESTOP, ETIMEDOUT, EWOULDBLOCK};
use crate::sys;
use crate::task::{self, TaskId, TaskMeta};
use crate::timer::{self, Unschedule};

use list::WaiterList;

/// A wait whose deadline is within this many microseconds of now times out
/// without queueing; sleeping for less is useless.
const LEAST_SLEEP_US: u64 = 1;

/// Alignment callers must honor when providing in-place storage.
pub const BUTEX_MEMORY_ALIGN: usize = 64;

/// Bytes of storage an in-place butex occupies.
pub const BUTEX_MEMORY_SIZE: usize = std::mem::size_of::<Butex>();

const WAITER_STATE_NONE: u8 = 0;
const WAITER_STATE_TIMED: u8 = 1;
const WAITER_STATE_CANCELLED: u8 = 2;
const WAITER_STATE_TIMEDOUT: u8 = 3;

const NOT_SIGNALLED: i32 = 0;
/// Reserved intermediate signal value; wakers go straight to
/// [`SAFE_TO_DESTROY`] because nothing distinguishes the two for a stack
/// waiter.
#[allow(dead_code)]
const SIGNALLED: i32 = 1;
const SAFE_TO_DESTROY: i32 = 2;

/// Common waiter header. Erasing a node from the middle of a linked list
/// cannot tell whether the node is on a list at all, so ownership is tagged
/// in `container`.
#[repr(C)]
pub(crate) struct ButexWaiter {
    prev: *mut ButexWaiter,
    next: *mut ButexWaiter,
    /// Zero marks a kernel-thread waiter.
    tid: TaskId,
    /// The butex this waiter is queued on, or null. Transitions only under
    /// that butex's waiter lock.
    container: AtomicPtr<Butex>,
}

impl ButexWaiter {
    pub(crate) fn new(tid: TaskId) -> ButexWaiter {
        ButexWaiter {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            tid,
            container: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Stack record of a task blocked in [`butex_wait`].
#[repr(C)]
struct TaskWaiter {
    base: ButexWaiter,
    meta: Arc<TaskMeta>,
    /// Pending timer id; 0 when no deadline was armed.
    sleep_id: AtomicU64,
    state: AtomicU8,
    /// Latched once the deferred enqueue links the waiter; distinguishes
    /// "timer fired before the enqueue" from "already woken".
    enqueued: AtomicBool,
    expected_value: i32,
    initial_butex: *mut Butex,
}

/// Stack record of a kernel thread (or pthread-mode task) blocked in
/// [`butex_wait`].
#[repr(C)]
struct ThreadWaiter {
    base: ButexWaiter,
    sig: AtomicI32,
}

/// The butex record. The user-visible word sits at offset 0 so that the
/// value pointer and the record pointer convert into each other.
#[repr(C, align(64))]
struct Butex {
    value: AtomicI32,
    /// Teardown refcount: wakes that outlive the owner's locking scheme hold
    /// a reference, and destruction drains it before releasing storage.
    unlock_nref: AtomicI32,
    waiters: Mutex<WaiterList>,
}

const _: () = assert!(offset_of!(Butex, value) == 0);
const _: () = assert!(std::mem::align_of::<Butex>() == BUTEX_MEMORY_ALIGN);

impl Butex {
    fn new() -> Butex {
        Butex {
            value: AtomicI32::new(0),
            unlock_nref: AtomicI32::new(0),
            waiters: Mutex::new(WaiterList::new()),
        }
    }
}

impl Drop for Butex {
    fn drop(&mut self) {
        if self.unlock_nref.load(Ordering::Relaxed) != 0 {
            tracing::warn!("butex destruction is racing with butex_wake");
            sys::spin_wait_while(|| self.unlock_nref.load(Ordering::Relaxed) != 0);
        }
        fence(Ordering::Acquire);
    }
}

/// Converts a value handle back into its butex.
///
/// # Safety
///
/// `value_ptr` must come from [`butex_create`] or [`butex_construct`] and
/// the butex must still be alive.
unsafe fn butex_of<'a>(value_ptr: *mut AtomicI32) -> &'a Butex {
    // SAFETY: the value is the first field, asserted above.
    unsafe { &*(value_ptr as *const Butex) }
}

/// Allocates a cache-line-aligned butex and returns its value handle, or
/// null with `ENOMEM` when allocation fails. The value starts at 0.
pub fn butex_create() -> *mut AtomicI32 {
    let layout = Layout::new::<Butex>();
    // SAFETY: the layout has non-zero size.
    let mem = unsafe { alloc(layout) } as *mut Butex;
    if mem.is_null() {
        errno::set_errno(errno::ENOMEM);
        return ptr::null_mut();
    }
    // SAFETY: `mem` is freshly allocated for a Butex.
    unsafe { ptr::write(mem, Butex::new()) };
    mem as *mut AtomicI32
}

/// Destroys a butex made by [`butex_create`]. Spins out any pending wake
/// references first.
///
/// # Safety
///
/// `butex` must come from [`butex_create`] and must not be used afterwards.
pub unsafe fn butex_destroy(butex: *mut AtomicI32) {
    if butex.is_null() {
        return;
    }
    let b = butex as *mut Butex;
    // SAFETY: per contract, `b` is a live create()d butex.
    unsafe {
        ptr::drop_in_place(b);
        dealloc(b as *mut u8, Layout::new::<Butex>());
    }
}

/// Constructs a butex in caller-provided storage of [`BUTEX_MEMORY_SIZE`]
/// bytes aligned to [`BUTEX_MEMORY_ALIGN`]. Returns the value handle, or
/// null with `EINVAL` for null or misaligned storage.
///
/// # Safety
///
/// `mem` must be valid for [`BUTEX_MEMORY_SIZE`] bytes of writes and stay
/// valid until [`butex_destruct`].
pub unsafe fn butex_construct(mem: *mut u8) -> *mut AtomicI32 {
    if mem.is_null() || (mem as usize) % BUTEX_MEMORY_ALIGN != 0 {
        errno::set_errno(errno::EINVAL);
        return ptr::null_mut();
    }
    let b = mem as *mut Butex;
    // SAFETY: per contract, `mem` is writable, aligned butex storage.
    unsafe { ptr::write(b, Butex::new()) };
    b as *mut AtomicI32
}

/// Destructs an in-place butex. Spins out any pending wake references, then
/// leaves the storage to the caller.
///
/// # Safety
///
/// `mem` must hold a butex constructed by [`butex_construct`].
pub unsafe fn butex_destruct(mem: *mut u8) {
    if mem.is_null() {
        return;
    }
    // SAFETY: per contract, `mem` holds a live in-place butex.
    unsafe { ptr::drop_in_place(mem as *mut Butex) };
}

/// Takes a wake reference that survives the caller dropping whatever lock
/// protects the butex; pair with a `*_and_remove_ref` wake or
/// [`butex_remove_ref`].
///
/// # Safety
///
/// `butex` must be a live butex handle.
pub unsafe fn butex_add_ref_before_wake(butex: *mut AtomicI32) {
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    b.unlock_nref.fetch_add(1, Ordering::Relaxed);
}

/// Releases a reference taken by [`butex_add_ref_before_wake`].
///
/// # Safety
///
/// `butex` must be a live butex handle with an outstanding reference.
pub unsafe fn butex_remove_ref(butex: *mut AtomicI32) {
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    b.unlock_nref.fetch_sub(1, Ordering::Release);
}

/// Signals a thread waiter and issues the kernel wakeup.
unsafe fn wakeup_pthread(pw: *mut ThreadWaiter) {
    // SAFETY: `pw` is still live here; the sig address is taken before the
    // store because the owner may reclaim the record the moment the new sig
    // is visible.
    let sig_ptr = unsafe { ptr::addr_of!((*pw).sig) } as *const AtomicI32;
    // Release so the woken thread sees every change published before the
    // wake when it sees the new sig.
    unsafe { (*pw).sig.store(SAFE_TO_DESTROY, Ordering::Release) };
    // The record may already be gone; the kernel answers EFAULT for a dead
    // mapping and that is fine.
    let _ = sys::futex_wake_private(sig_ptr, 1);
}

/// Returns 0 when there is no timer to cancel or it was cancelled, -1 when
/// the timer callback is running right now and the caller must retry.
fn unsleep_if_necessary(w: &TaskWaiter) -> i32 {
    let sleep_id = w.sleep_id.load(Ordering::Relaxed);
    if sleep_id == 0 {
        return 0;
    }
    if timer::global_timer().unschedule(sleep_id) == Unschedule::Running {
        return -1;
    }
    w.sleep_id.store(0, Ordering::Relaxed);
    0
}

/// Shared eraser: unlinks `bw` from whatever butex currently owns it.
///
/// No-op when `container` is null, so the normal wake, the timer and a
/// remote stop can race freely; at most one of them succeeds. Task waiters
/// erased here are marked timed out (the stop path outranks that marker at
/// resumption). Preserves the caller's errno.
///
/// # Safety
///
/// `bw` must point to a live waiter record; the owning waiter must not
/// unwind its stack until this call is over (guaranteed by the resume-side
/// spins).
unsafe fn erase_from_butex(bw: *mut ButexWaiter, wakeup: bool) -> bool {
    let saved_errno = errno::get_errno();
    let mut erased = false;
    loop {
        // SAFETY: `bw` is live per contract.
        let b = unsafe { (*bw).container.load(Ordering::Acquire) };
        if b.is_null() {
            break;
        }
        // SAFETY: a non-null container is a live butex: waiters must be
        // erased before their butex dies.
        let butex = unsafe { &*b };
        let mut waiters = butex.waiters.lock();
        // SAFETY: `bw` is live per contract.
        if b == unsafe { (*bw).container.load(Ordering::Relaxed) } {
            // SAFETY: container says `bw` is on this list.
            unsafe {
                waiters.remove(bw);
                (*bw).container.store(ptr::null_mut(), Ordering::Relaxed);
                if (*bw).tid != 0 {
                    let tw = bw as *mut TaskWaiter;
                    (*tw).state.store(WAITER_STATE_TIMEDOUT, Ordering::Relaxed);
                }
            }
            erased = true;
            break;
        }
        drop(waiters);
    }
    if erased && wakeup {
        // SAFETY: `bw` is live per contract.
        if unsafe { (*bw).tid } != 0 {
            let tw = bw as *mut TaskWaiter;
            // SAFETY: task waiters embed their task's metadata handle.
            task::ready_to_run(unsafe { &(*tw).meta });
        } else {
            // SAFETY: tid 0 means `bw` heads a ThreadWaiter.
            unsafe { wakeup_pthread(bw as *mut ThreadWaiter) };
        }
    }
    errno::set_errno(saved_errno);
    erased
}

/// Timer-thread entry for a timed task waiter.
///
/// Callable while the normal wake and a remote stop race it; at most one of
/// the three resumes the task.
unsafe fn timer_erase_and_wake(arg: *mut ()) {
    let bw = arg as *mut TaskWaiter;
    loop {
        // SAFETY: the waiting task spins out this callback before its stack
        // unwinds, so `bw` stays live for the whole call.
        let base = unsafe { ptr::addr_of_mut!((*bw).base) } as *mut ButexWaiter;
        if unsafe { erase_from_butex(base, true) } {
            return;
        }
        // SAFETY: as above; initial_butex outlives the wait.
        let b0 = unsafe { &*(*bw).initial_butex };
        let _guard = b0.waiters.lock();
        // SAFETY: as above.
        let w = unsafe { &*bw };
        if !w.enqueued.load(Ordering::Relaxed) {
            // Fired before the deferred enqueue. Mark the timeout under the
            // initial butex's lock; the enqueue observes it under the same
            // lock, declines to queue, and readies the task itself.
            if w.state.load(Ordering::Relaxed) == WAITER_STATE_TIMED {
                w.state.store(WAITER_STATE_TIMEDOUT, Ordering::Relaxed);
            }
            return;
        }
        if w.base.container.load(Ordering::Relaxed).is_null() {
            // Queued once and since detached: a waker owns the resumption.
            return;
        }
        // Requeued between the checks; go after the new container.
    }
}

/// Resumes one detached waiter. Thread waiters get a kernel wake; task
/// waiters first have any pending timer spun out (the callback may still be
/// on the waiter's stack), then go to the runtime, by direct handoff when
/// the caller is itself a task.
unsafe fn dispatch_one(w: *mut ButexWaiter) {
    // SAFETY: `w` was just detached under the waiter lock and its owner
    // cannot resume before we hand it the wakeup.
    if unsafe { (*w).tid } == 0 {
        unsafe { wakeup_pthread(w as *mut ThreadWaiter) };
        return;
    }
    let tw = w as *mut TaskWaiter;
    // SAFETY: as above.
    sys::spin_wait_while(|| unsafe { unsleep_if_necessary(&*tw) } < 0);
    if task::current_tid() != 0 {
        // SAFETY: as above.
        task::handoff(unsafe { &(*tw).meta });
    } else {
        // SAFETY: as above.
        task::ready_to_run(unsafe { &(*tw).meta });
    }
}

/// Wakes at most one waiter. Returns how many were woken.
///
/// # Safety
///
/// `butex` must be a live butex handle.
pub unsafe fn butex_wake(butex: *mut AtomicI32) -> c_int {
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    let front;
    {
        let mut waiters = b.waiters.lock();
        front = waiters.pop_front();
        if front.is_null() {
            return 0;
        }
        // SAFETY: `front` was on the list, hence live.
        unsafe { (*front).container.store(ptr::null_mut(), Ordering::Relaxed) };
    }
    // SAFETY: detached under the lock above.
    unsafe { dispatch_one(front) };
    1
}

/// [`butex_wake`] plus release of one wake reference. The reference is
/// dropped after the waiter is detached but before it is resumed, so a
/// woken owner may destroy the butex immediately.
///
/// # Safety
///
/// `butex` must be a live butex handle with an outstanding reference.
pub unsafe fn butex_wake_and_remove_ref(butex: *mut AtomicI32) -> c_int {
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    let front;
    {
        let mut waiters = b.waiters.lock();
        front = waiters.pop_front();
        if !front.is_null() {
            // SAFETY: `front` was on the list, hence live.
            unsafe { (*front).container.store(ptr::null_mut(), Ordering::Relaxed) };
        }
    }
    // Last touch of the butex: the release decrement licenses a destruction
    // that may be spinning on the count, so the lock is already dropped.
    b.unlock_nref.fetch_sub(1, Ordering::Release);
    if front.is_null() {
        return 0;
    }
    // SAFETY: detached under the lock above.
    unsafe { dispatch_one(front) };
    1
}

unsafe fn butex_wake_all_impl(b: &Butex, remove_ref: bool) -> c_int {
    let mut task_waiters = WaiterList::new();
    let mut thread_waiters = WaiterList::new();
    {
        let mut waiters = b.waiters.lock();
        loop {
            let w = waiters.pop_front();
            if w.is_null() {
                break;
            }
            // SAFETY: `w` was on the list, hence live; it stays live until
            // it is handed its wakeup below.
            unsafe {
                (*w).container.store(ptr::null_mut(), Ordering::Relaxed);
                if (*w).tid != 0 {
                    task_waiters.push_back(w);
                } else {
                    thread_waiters.push_back(w);
                }
            }
        }
    }
    if remove_ref {
        b.unlock_nref.fetch_sub(1, Ordering::Release);
    }

    let mut nwakeup = 0;
    // Thread waiters first: their wakeup is one syscall and cannot preempt
    // this thread.
    loop {
        let w = thread_waiters.pop_front();
        if w.is_null() {
            break;
        }
        // SAFETY: detached above.
        unsafe { wakeup_pthread(w as *mut ThreadWaiter) };
        nwakeup += 1;
    }
    if task_waiters.is_empty() {
        return nwakeup;
    }
    // The first task waiter is handed off at the end; the rest become
    // runnable without kernel wakeups and get them in one batch.
    let next = task_waiters.pop_front() as *mut TaskWaiter;
    // SAFETY: detached above; the timer callback is spun out before the
    // waiter can resume.
    sys::spin_wait_while(|| unsafe { unsleep_if_necessary(&*next) } < 0);
    nwakeup += 1;
    let saved_nwakeup = nwakeup;
    loop {
        let w = task_waiters.pop_front();
        if w.is_null() {
            break;
        }
        let tw = w as *mut TaskWaiter;
        // SAFETY: as for `next`.
        sys::spin_wait_while(|| unsafe { unsleep_if_necessary(&*tw) } < 0);
        // SAFETY: last touch of the record; only the metadata handle is used
        // from here on.
        task::ready_to_run_nosignal(unsafe { &(*tw).meta });
        nwakeup += 1;
    }
    if saved_nwakeup != nwakeup {
        task::flush_nosignal();
    }
    if task::current_tid() != 0 {
        // SAFETY: as for `next`.
        task::handoff(unsafe { &(*next).meta });
    } else {
        // SAFETY: as for `next`.
        task::ready_to_run(unsafe { &(*next).meta });
    }
    nwakeup
}

/// Wakes every waiter. Returns how many were woken.
///
/// # Safety
///
/// `butex` must be a live butex handle.
pub unsafe fn butex_wake_all(butex: *mut AtomicI32) -> c_int {
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    // SAFETY: `b` is live for the whole call.
    unsafe { butex_wake_all_impl(b, false) }
}

/// [`butex_wake_all`] plus release of one wake reference, dropped right
/// after the list is detached.
///
/// # Safety
///
/// `butex` must be a live butex handle with an outstanding reference.
pub unsafe fn butex_wake_all_and_remove_ref(butex: *mut AtomicI32) -> c_int {
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    // SAFETY: `b` is live for the whole call.
    unsafe { butex_wake_all_impl(b, true) }
}

/// Wakes every waiter except the task `excluded`, which is put back at the
/// head of the list with its ownership tag intact. Returns how many were
/// woken.
///
/// # Safety
///
/// `butex` must be a live butex handle.
pub unsafe fn butex_wake_except(butex: *mut AtomicI32, excluded: TaskId) -> c_int {
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    let mut task_waiters = WaiterList::new();
    let mut thread_waiters = WaiterList::new();
    {
        let mut waiters = b.waiters.lock();
        let mut excluded_waiter: *mut ButexWaiter = ptr::null_mut();
        loop {
            let w = waiters.pop_front();
            if w.is_null() {
                break;
            }
            // SAFETY: `w` was on the list, hence live.
            unsafe {
                if (*w).tid != 0 {
                    if (*w).tid != excluded {
                        (*w).container.store(ptr::null_mut(), Ordering::Relaxed);
                        task_waiters.push_back(w);
                    } else {
                        excluded_waiter = w;
                    }
                } else {
                    (*w).container.store(ptr::null_mut(), Ordering::Relaxed);
                    thread_waiters.push_back(w);
                }
            }
        }
        if !excluded_waiter.is_null() {
            // Still owned by this butex; its container tag never changed.
            // SAFETY: popped above, re-linked under the same lock hold.
            unsafe { waiters.push_back(excluded_waiter) };
        }
    }

    let mut nwakeup = 0;
    loop {
        let w = thread_waiters.pop_front();
        if w.is_null() {
            break;
        }
        // SAFETY: detached above.
        unsafe { wakeup_pthread(w as *mut ThreadWaiter) };
        nwakeup += 1;
    }
    if task_waiters.is_empty() {
        return nwakeup;
    }
    // Same dispatch as a full wake: the first surviving task waiter is
    // handed off at the end, the rest go through the no-signal batch.
    let next = task_waiters.pop_front() as *mut TaskWaiter;
    // SAFETY: detached above; the timer callback is spun out before the
    // waiter can resume.
    sys::spin_wait_while(|| unsafe { unsleep_if_necessary(&*next) } < 0);
    nwakeup += 1;
    let saved_nwakeup = nwakeup;
    loop {
        let w = task_waiters.pop_front();
        if w.is_null() {
            break;
        }
        let tw = w as *mut TaskWaiter;
        // SAFETY: as for `next`.
        sys::spin_wait_while(|| unsafe { unsleep_if_necessary(&*tw) } < 0);
        // SAFETY: last touch of the record.
        task::ready_to_run_nosignal(unsafe { &(*tw).meta });
        nwakeup += 1;
    }
    if saved_nwakeup != nwakeup {
        task::flush_nosignal();
    }
    if task::current_tid() != 0 {
        // SAFETY: as for `next`.
        task::handoff(unsafe { &(*next).meta });
    } else {
        // SAFETY: as for `next`.
        task::ready_to_run(unsafe { &(*next).meta });
    }
    nwakeup
}

/// Wakes the oldest waiter of `butex` and moves the remaining waiters onto
/// `mbutex`, retagging their ownership. Returns 1 when a waiter was woken,
/// 0 when `butex` had none (and then touches neither list).
///
/// # Safety
///
/// Both handles must be live butex handles.
pub unsafe fn butex_requeue(butex: *mut AtomicI32, mbutex: *mut AtomicI32) -> c_int {
    if std::ptr::eq(butex, mbutex) {
        // Nothing to move; degenerates to waking the head.
        // SAFETY: per contract.
        return unsafe { butex_wake(butex) };
    }
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    // SAFETY: per contract.
    let m = unsafe { butex_of(mbutex) };

    let front;
    {
        // Address-ordered double lock; any two requeues agree on the order.
        let (mut gb, mut gm);
        if (b as *const Butex) < (m as *const Butex) {
            gb = b.waiters.lock();
            gm = m.waiters.lock();
        } else {
            gm = m.waiters.lock();
            gb = b.waiters.lock();
        }
        front = gb.pop_front();
        if front.is_null() {
            return 0;
        }
        // SAFETY: `front` was on the list, hence live.
        unsafe { (*front).container.store(ptr::null_mut(), Ordering::Relaxed) };
        loop {
            let w = gb.pop_front();
            if w.is_null() {
                break;
            }
            // SAFETY: `w` was on the list, hence live; it is retagged under
            // both locks.
            unsafe {
                gm.push_back(w);
                (*w).container
                    .store(m as *const Butex as *mut Butex, Ordering::Relaxed);
            }
        }
    }
    // SAFETY: detached under the locks above.
    unsafe { dispatch_one(front) };
    1
}

/// Deferred enqueue: runs after the waiting task has suspended. Re-checks
/// the wait condition under the waiter lock and either links the waiter or
/// cancels the wait and readies the task again.
unsafe fn wait_for_butex(bw: *mut TaskWaiter) {
    // SAFETY: `bw` is on the suspended task's stack, which cannot unwind
    // before the task is resumed, and resumption is what this function
    // arranges.
    let b = unsafe { &*(*bw).initial_butex };
    {
        let mut waiters = b.waiters.lock();
        // SAFETY: as above.
        let w = unsafe { &*bw };
        let stopped = w.meta.is_stopped() && w.meta.is_interruptible();
        if b.value.load(Ordering::Relaxed) == w.expected_value
            && w.state.load(Ordering::Relaxed) != WAITER_STATE_TIMEDOUT
            && !stopped
        {
            // SAFETY: the waiter is not on any list yet.
            unsafe { waiters.push_back(ptr::addr_of_mut!((*bw).base) as *mut ButexWaiter) };
            w.enqueued.store(true, Ordering::Relaxed);
            w.base
                .container
                .store(b as *const Butex as *mut Butex, Ordering::Relaxed);
            return;
        }
    }
    // Not queued: container is null, which makes the timer eraser and the
    // stopper no-ops on this record, so it is exclusively ours again.
    // SAFETY: as above.
    let w = unsafe { &*bw };
    unsleep_if_necessary(w);
    if w.state.load(Ordering::Relaxed) != WAITER_STATE_TIMEDOUT {
        w.state.store(WAITER_STATE_CANCELLED, Ordering::Relaxed);
    }
    task::ready_to_run(&w.meta);
}

/// Task-path wait: build the stack waiter, optionally arm the timer, publish
/// the cancellation slot, then enqueue-and-suspend through the runtime.
unsafe fn butex_wait_from_task(
    b: &Butex,
    meta: Arc<TaskMeta>,
    expected_value: i32,
    abstime: Option<Instant>,
) -> c_int {
    let mut bw = TaskWaiter {
        base: ButexWaiter::new(meta.tid()),
        meta: meta.clone(),
        sleep_id: AtomicU64::new(0),
        state: AtomicU8::new(WAITER_STATE_NONE),
        enqueued: AtomicBool::new(false),
        expected_value,
        initial_butex: b as *const Butex as *mut Butex,
    };
    let bw_ptr = &mut bw as *mut TaskWaiter;

    if let Some(deadline) = abstime {
        // Arm the timer before queueing; if it fires first, the deferred
        // enqueue is cancelled.
        bw.state.store(WAITER_STATE_TIMED, Ordering::Relaxed);
        if deadline <= Instant::now() + Duration::from_micros(LEAST_SLEEP_US) {
            errno::set_errno(ETIMEDOUT);
            return -1;
        }
        // SAFETY: `bw` outlives the wait; the resume path spins the callback
        // out before unwinding.
        let sleep_id = unsafe {
            timer::global_timer().schedule(timer_erase_and_wake, bw_ptr as *mut (), deadline)
        };
        if sleep_id == 0 {
            // Timer stopped; the process is shutting down.
            errno::set_errno(ESTOP);
            return -1;
        }
        bw.sleep_id.store(sleep_id, Ordering::Relaxed);
    }
    // Release pairs with the stopper's acquire exchange of the slot, which
    // also carries the interruptible flag across.
    // SAFETY: `bw` is this frame's record.
    meta.current_waiter
        .store(unsafe { ptr::addr_of_mut!((*bw_ptr).base) }, Ordering::Release);
    // SAFETY: the callback runs exactly once, before the suspend returns.
    task::suspend_current(&meta, || unsafe { wait_for_butex(bw_ptr) });

    // The timer callback may still be on this stack record; spin it out.
    // SAFETY: `bw_ptr` is this frame's waiter.
    sys::spin_wait_while(|| unsafe { unsleep_if_necessary(&*bw_ptr) } < 0);
    // A null slot means a stopper is still using the record; spin until it
    // is handed back.
    sys::spin_wait_while(|| {
        meta.current_waiter
            .swap(ptr::null_mut(), Ordering::Acquire)
            .is_null()
    });

    // Fixed priority: stop, then timeout, then unmatched value.
    if meta.is_stopped() && meta.is_interruptible() {
        errno::set_errno(ESTOP);
        return -1;
    }
    match bw.state.load(Ordering::Relaxed) {
        WAITER_STATE_TIMEDOUT => {
            errno::set_errno(ETIMEDOUT);
            -1
        }
        WAITER_STATE_CANCELLED => {
            errno::set_errno(EWOULDBLOCK);
            -1
        }
        _ => 0,
    }
}

/// Waits on the thread waiter's signal word until a waker moves it off
/// `NOT_SIGNALLED`; spurious wakeups loop. On timeout the waiter erases
/// itself, spinning out a concurrent waker if one got to the record first.
///
/// # Safety
///
/// `pw` must be the calling frame's queued waiter.
unsafe fn wait_pthread(pw: *mut ThreadWaiter, timeout: Option<&libc::timespec>) -> c_int {
    // SAFETY: `pw` outlives this call per contract; sig is an atomic, so
    // reading it next to concurrent wakers is fine.
    let sig = unsafe { &(*pw).sig };
    loop {
        let rc = sys::futex_wait_private(sig, NOT_SIGNALLED, timeout);
        // Acquire so this thread sees what was published before the wake
        // when it sees the new sig.
        if sig.load(Ordering::Acquire) != NOT_SIGNALLED {
            // A waker committed to this record: the wait succeeded no matter
            // what the kernel call reported (EAGAIN when the wake landed
            // before the sleep, EINTR, a timeout that lost the race). The
            // record can be reused by the owner from here on.
            return 0;
        }
        match rc {
            Ok(()) | Err(errno::EINTR) => {
                // Spurious wakeup with sig unchanged; wait again.
            }
            Err(e) => {
                // Timed out (or the kernel refused the wait). Remove the
                // record so nobody signals it after this function returns.
                let base = unsafe { ptr::addr_of_mut!((*pw).base) };
                // SAFETY: `pw` is this frame's waiter.
                if !unsafe { erase_from_butex(base, false) } {
                    // A waker got to the record first and owns the wakeup;
                    // spin until it is safe to unwind, then report the wake.
                    sys::spin_wait_while(|| sig.load(Ordering::Acquire) != SAFE_TO_DESTROY);
                    return 0;
                }
                errno::set_errno(e);
                return -1;
            }
        }
    }
}

/// Thread-path wait, taken by plain threads and pthread-mode tasks.
unsafe fn butex_wait_from_pthread(
    current: Option<Arc<TaskMeta>>,
    b: &Butex,
    expected_value: i32,
    abstime: Option<Instant>,
) -> c_int {
    // The kernel futex wants a relative timeout.
    let timeout = match abstime {
        Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
            Some(left) if left > Duration::from_micros(LEAST_SLEEP_US) => {
                Some(sys::duration_to_timespec(left))
            }
            _ => {
                errno::set_errno(ETIMEDOUT);
                return -1;
            }
        },
        None => None,
    };

    let mut pw = ThreadWaiter {
        base: ButexWaiter::new(0),
        sig: AtomicI32::new(NOT_SIGNALLED),
    };
    let pw_ptr = &mut pw as *mut ThreadWaiter;
    let mut published_waiter = false;
    if let Some(meta) = current.as_deref() {
        if meta.is_interruptible() {
            if meta.is_stopped() {
                errno::set_errno(ESTOP);
                return -1;
            }
            published_waiter = true;
            // SAFETY: `pw` is this frame's record.
            meta.current_waiter.store(
                unsafe { ptr::addr_of_mut!((*pw_ptr).base) },
                Ordering::Release,
            );
        }
    }

    let rc;
    {
        let mut waiters = b.waiters.lock();
        if b.value.load(Ordering::Relaxed) == expected_value {
            // SAFETY: `pw` lives until this function returns; removal is
            // governed by the container protocol.
            unsafe {
                waiters.push_back(ptr::addr_of_mut!((*pw_ptr).base));
                (*pw_ptr)
                    .base
                    .container
                    .store(b as *const Butex as *mut Butex, Ordering::Relaxed);
            }
            drop(waiters);
            // SAFETY: queued above; the record outlives the call.
            rc = unsafe { wait_pthread(pw_ptr, timeout.as_ref()) };
        } else {
            drop(waiters);
            errno::set_errno(EWOULDBLOCK);
            rc = -1;
        }
    }

    if let Some(meta) = current.as_deref() {
        if published_waiter {
            // A null slot means a stopper is still using the record; spin
            // until it is handed back.
            sys::spin_wait_while(|| {
                meta.current_waiter
                    .swap(ptr::null_mut(), Ordering::Acquire)
                    .is_null()
            });
        }
        if meta.is_stopped() && meta.is_interruptible() {
            errno::set_errno(ESTOP);
            return -1;
        }
    }
    rc
}

/// Blocks the caller until the value at `butex` stops being
/// `expected_value`, a waker picks it, the deadline passes, or a remote stop
/// cancels the wait.
///
/// Returns 0 on wakeup; otherwise -1 with the thread-local errno set to
/// `EWOULDBLOCK` (value already differed, possibly observed at the deferred
/// re-check), `ETIMEDOUT`, `ESTOP`, or whatever the kernel futex surfaced on
/// the thread path.
///
/// # Safety
///
/// `butex` must be a live butex handle, and it must stay alive until every
/// waiter has returned.
pub unsafe fn butex_wait(
    butex: *mut AtomicI32,
    expected_value: i32,
    abstime: Option<Instant>,
) -> c_int {
    // SAFETY: per contract.
    let b = unsafe { butex_of(butex) };
    if b.value.load(Ordering::Relaxed) != expected_value {
        errno::set_errno(EWOULDBLOCK);
        // Callers may act on the mismatch immediately; make everything
        // published before the value change visible to them.
        fence(Ordering::Acquire);
        return -1;
    }
    match task::current_meta() {
        // SAFETY: `b` stays live per contract.
        Some(meta) if !meta.is_pthread_mode() => unsafe {
            butex_wait_from_task(b, meta, expected_value, abstime)
        },
        // SAFETY: `b` stays live per contract.
        current => unsafe { butex_wait_from_pthread(current, b, expected_value, abstime) },
    }
}

/// [`butex_wait`] with stop delivery disabled for the duration: the caller's
/// interruptible flag is cleared around the wait and restored afterwards.
///
/// # Safety
///
/// As for [`butex_wait`].
pub unsafe fn butex_wait_uninterruptible(
    butex: *mut AtomicI32,
    expected_value: i32,
    abstime: Option<Instant>,
) -> c_int {
    let caller = task::current_meta();
    let saved_interruptible = caller.as_deref().map(|meta| {
        let saved = meta.is_interruptible();
        meta.set_interruptible(false);
        saved
    });
    // SAFETY: per contract.
    let rc = unsafe { butex_wait(butex, expected_value, abstime) };
    if let (Some(meta), Some(saved)) = (caller.as_deref(), saved_interruptible) {
        meta.set_interruptible(saved);
    }
    rc
}

/// Cancels the butex wait of the task `tid` from any thread: consumes the
/// task's cancellation slot, erases and wakes the waiter, then hands the
/// slot back. Returns 0 on success, -1 with `ESRCH` when no such task
/// exists. A task that is not blocked (or not interruptible) just has its
/// stop recorded.
pub fn stop_butex_wait(tid: TaskId) -> c_int {
    let Ok((meta, w)) = task::stop_and_consume_waiter(tid) else {
        errno::set_errno(errno::ESRCH);
        return -1;
    };
    if !w.is_null() {
        // SAFETY: the waiting task spins until the slot is handed back, so
        // the stack record stays live while we use it.
        unsafe { erase_from_butex(w, true) };
        task::set_waiter(&meta, w);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_sits_at_offset_zero() {
        assert_eq!(offset_of!(Butex, value), 0);
        assert_eq!(BUTEX_MEMORY_SIZE, std::mem::size_of::<Butex>());
        assert_eq!(BUTEX_MEMORY_ALIGN, std::mem::align_of::<Butex>());
    }

    #[test]
    fn create_gives_zeroed_value_and_aligned_record() {
        let h = butex_create();
        assert!(!h.is_null());
        assert_eq!(h as usize % BUTEX_MEMORY_ALIGN, 0);
        unsafe {
            assert_eq!((*h).load(Ordering::SeqCst), 0);
            (*h).store(42, Ordering::SeqCst);
            assert_eq!((*h).load(Ordering::SeqCst), 42);
            butex_destroy(h);
        }
    }

    #[test]
    fn destroy_null_is_a_noop() {
        unsafe { butex_destroy(ptr::null_mut()) };
        unsafe { butex_destruct(ptr::null_mut()) };
    }

    #[test]
    fn construct_in_aligned_storage() {
        #[repr(align(64))]
        struct Storage([u8; BUTEX_MEMORY_SIZE]);
        let mut storage = Storage([0; BUTEX_MEMORY_SIZE]);
        let h = unsafe { butex_construct(storage.0.as_mut_ptr()) };
        assert!(!h.is_null());
        assert_eq!(h as usize, storage.0.as_ptr() as usize);
        unsafe {
            (*h).store(7, Ordering::SeqCst);
            assert_eq!(butex_wake(h), 0);
            butex_destruct(storage.0.as_mut_ptr());
        }
    }

    #[test]
    fn construct_rejects_misaligned_storage() {
        let mut storage = [0u8; BUTEX_MEMORY_SIZE + 1];
        let base = storage.as_mut_ptr();
        let misaligned = if base as usize % BUTEX_MEMORY_ALIGN == 0 {
            // An aligned buffer start: offset by one to break it.
            unsafe { base.add(1) }
        } else {
            base
        };
        errno::set_errno(0);
        let h = unsafe { butex_construct(misaligned) };
        assert!(h.is_null());
        assert_eq!(errno::get_errno(), errno::EINVAL);
    }

    #[test]
    fn wait_on_unmatched_value_would_block() {
        let h = butex_create();
        unsafe {
            (*h).store(1, Ordering::SeqCst);
            assert_eq!(butex_wait(h, 0, None), -1);
            assert_eq!(errno::get_errno(), EWOULDBLOCK);
            butex_destroy(h);
        }
    }

    #[test]
    fn wake_on_empty_list_reports_zero() {
        let h = butex_create();
        unsafe {
            assert_eq!(butex_wake(h), 0);
            assert_eq!(butex_wake_all(h), 0);
            assert_eq!(butex_wake_except(h, 1), 0);
            butex_destroy(h);
        }
    }

    #[test]
    fn requeue_from_empty_touches_nothing() {
        let h1 = butex_create();
        let h2 = butex_create();
        unsafe {
            assert_eq!(butex_requeue(h1, h2), 0);
            butex_destroy(h1);
            butex_destroy(h2);
        }
    }

    #[test]
    fn requeue_onto_itself_degenerates_to_wake() {
        let h = butex_create();
        unsafe {
            assert_eq!(butex_requeue(h, h), 0);
            butex_destroy(h);
        }
    }

    #[test]
    fn wake_and_remove_ref_drops_ref_with_no_waiters() {
        let h = butex_create();
        unsafe {
            butex_add_ref_before_wake(h);
            assert_eq!(butex_wake_and_remove_ref(h), 0);
            butex_add_ref_before_wake(h);
            assert_eq!(butex_wake_all_and_remove_ref(h), 0);
            butex_add_ref_before_wake(h);
            butex_remove_ref(h);
            // All references released; destruction must not spin.
            butex_destroy(h);
        }
    }

    #[test]
    fn immediate_deadline_times_out_without_queueing() {
        let h = butex_create();
        unsafe {
            assert_eq!(butex_wait(h, 0, Some(Instant::now())), -1);
            assert_eq!(errno::get_errno(), ETIMEDOUT);
            // The list stayed empty.
            assert_eq!(butex_wake(h), 0);
            butex_destroy(h);
        }
    }

    #[test]
    fn stop_on_unknown_task_fails_with_esrch() {
        errno::set_errno(0);
        assert_eq!(stop_butex_wait(u64::MAX - 1), -1);
        assert_eq!(errno::get_errno(), errno::ESRCH);
    }

    #[test]
    fn eraser_is_a_noop_on_unqueued_waiter() {
        let mut w = ButexWaiter::new(0);
        // SAFETY: `w` has a null container, so the eraser must not touch any
        // list.
        assert!(!unsafe { erase_from_butex(&mut w, true) });
    }
}
