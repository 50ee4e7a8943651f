//! The task runtime the butex schedules against.
//!
//! Tasks are units of work with runtime-owned suspension: a task blocked on
//! a butex gives its wakeup to the runtime (a futex parker) instead of the
//! kernel, which is what lets remote threads erase, requeue, and stop it
//! while it sleeps. Each task currently runs on a dedicated thread; the
//! interface the butex consumes (ready queues with deferred signalling,
//! direct handoff, a callback run after the task has suspended) is the
//! M:N-shaped one, so the core never knows the difference.

mod parker;

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;

use crate::butex::ButexWaiter;
use parker::Parker;

/// Task identifier. Zero is reserved and marks a plain kernel thread.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<TaskMeta>>> = const { RefCell::new(None) };
    static NOSIGNAL_PENDING: RefCell<Vec<Arc<TaskMeta>>> = const { RefCell::new(Vec::new()) };
}

fn registry() -> &'static Mutex<HashMap<TaskId, Arc<TaskMeta>>> {
    static TASKS: OnceLock<Mutex<HashMap<TaskId, Arc<TaskMeta>>>> = OnceLock::new();
    TASKS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn fresh_tid() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Spawn-time attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskAttr {
    /// A pthread-mode task never suspends through the runtime: butex waits
    /// from it block the host thread in the kernel, with the cancellation
    /// slot still published so remote stops find it.
    pub pthread_mode: bool,
}

/// Per-task bookkeeping shared between the task, wakers, the timer thread,
/// and stoppers.
pub struct TaskMeta {
    tid: TaskId,
    pthread_mode: bool,
    stop: AtomicBool,
    interruptible: AtomicBool,
    /// Serializes interruptible transitions against stoppers consuming the
    /// slot, so a stop can never erase a wait that had already turned
    /// uninterruptible.
    interrupt_lock: Mutex<()>,
    /// Cancellation slot: the waiter this task is currently blocked on, for
    /// remote stoppers to find. Null while not waiting, and transiently null
    /// while a stopper owns the waiter.
    pub(crate) current_waiter: AtomicPtr<ButexWaiter>,
    parker: Parker,
}

impl TaskMeta {
    fn new(tid: TaskId, pthread_mode: bool) -> Self {
        TaskMeta {
            tid,
            pthread_mode,
            stop: AtomicBool::new(false),
            interruptible: AtomicBool::new(true),
            interrupt_lock: Mutex::new(()),
            current_waiter: AtomicPtr::new(std::ptr::null_mut()),
            parker: Parker::new(),
        }
    }

    pub fn tid(&self) -> TaskId {
        self.tid
    }

    pub fn is_pthread_mode(&self) -> bool {
        self.pthread_mode
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn set_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_interruptible(&self) -> bool {
        self.interruptible.load(Ordering::Acquire)
    }

    pub(crate) fn set_interruptible(&self, value: bool) {
        // A stopper holding the lock has already decided based on the old
        // value; the transition waits it out.
        let _guard = self.interrupt_lock.lock();
        self.interruptible.store(value, Ordering::Release);
    }
}

/// Owner handle for a spawned task.
pub struct TaskHandle {
    tid: TaskId,
    thread: thread::JoinHandle<()>,
}

impl TaskHandle {
    pub fn tid(&self) -> TaskId {
        self.tid
    }

    /// Waits for the task to finish. Panics from the task body are surfaced
    /// in the returned result.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

/// Deregisters on drop so a panicking task body cannot leak its entry.
struct TaskScope {
    meta: Arc<TaskMeta>,
}

impl TaskScope {
    fn enter(meta: Arc<TaskMeta>) -> Self {
        registry().lock().insert(meta.tid, meta.clone());
        CURRENT_TASK.with(|c| *c.borrow_mut() = Some(meta.clone()));
        TaskScope { meta }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        CURRENT_TASK.with(|c| *c.borrow_mut() = None);
        registry().lock().remove(&self.meta.tid);
    }
}

/// Spawns a task with default attributes.
pub fn spawn<F>(f: F) -> std::io::Result<TaskHandle>
where
    F: FnOnce() + Send + 'static,
{
    spawn_with_attr(TaskAttr::default(), f)
}

/// Spawns a task with the given attributes.
pub fn spawn_with_attr<F>(attr: TaskAttr, f: F) -> std::io::Result<TaskHandle>
where
    F: FnOnce() + Send + 'static,
{
    let tid = fresh_tid();
    let meta = Arc::new(TaskMeta::new(tid, attr.pthread_mode));
    let thread = thread::Builder::new()
        .name(format!("task-{tid}"))
        .spawn(move || {
            let _scope = TaskScope::enter(meta);
            f();
        })?;
    Ok(TaskHandle { tid, thread })
}

/// The calling task's id, or 0 when the caller is a plain thread.
pub fn current_tid() -> TaskId {
    CURRENT_TASK.with(|c| c.borrow().as_ref().map_or(0, |m| m.tid))
}

/// The calling task's metadata, if any.
pub fn current_meta() -> Option<Arc<TaskMeta>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// True when the caller is a pthread-mode task.
pub fn is_pthread_task() -> bool {
    CURRENT_TASK.with(|c| c.borrow().as_ref().is_some_and(|m| m.pthread_mode))
}

/// Looks a task up by id.
pub fn meta_of(tid: TaskId) -> Option<Arc<TaskMeta>> {
    registry().lock().get(&tid).cloned()
}

/// Suspends the calling task after running `remained`.
///
/// `remained` is the deferred step (typically the butex enqueue): it runs
/// once the task is logically suspended, so a ready delivered from any
/// thread during or after it is held as a token and consumed by the park.
pub(crate) fn suspend_current<F: FnOnce()>(meta: &TaskMeta, remained: F) {
    debug_assert_eq!(meta.tid, current_tid());
    remained();
    meta.parker.park();
}

/// Makes a suspended task runnable, waking it immediately.
///
/// Takes its own reference first: the caller's may live inside the waiter
/// record, which the woken task is free to reclaim the moment the token is
/// visible.
pub(crate) fn ready_to_run(meta: &Arc<TaskMeta>) {
    let meta = Arc::clone(meta);
    meta.parker.unpark();
}

/// Makes a suspended task runnable without the kernel wakeup; the wakeup is
/// owed to [`flush_nosignal`] on the same thread.
///
/// The waiter record belonging to `meta` must not be touched after this
/// call: the token alone is enough for the task to resume.
pub(crate) fn ready_to_run_nosignal(meta: &Arc<TaskMeta>) {
    // Clone before the token store: once the token is visible the caller's
    // reference (typically inside the waiter record) may be gone.
    let meta = Arc::clone(meta);
    if meta.parker.unpark_deferred() {
        NOSIGNAL_PENDING.with(|p| p.borrow_mut().push(meta));
    }
}

/// Issues the wakeups batched by [`ready_to_run_nosignal`].
pub(crate) fn flush_nosignal() {
    NOSIGNAL_PENDING.with(|p| {
        for meta in p.borrow_mut().drain(..) {
            meta.parker.wake_parked();
        }
    });
}

/// Direct handoff: wake `meta` and give up the caller's timeslice so the
/// woken task gets the CPU first. The stack-splicing variant of this is
/// deliberately not implemented (see DESIGN.md).
pub(crate) fn handoff(meta: &Arc<TaskMeta>) {
    let meta = Arc::clone(meta);
    meta.parker.unpark();
    thread::yield_now();
}

/// Marks the task stopped and, when it is interruptible, takes ownership of
/// its current waiter (possibly null if it is not blocked).
///
/// Returns `Err(())` when no such task exists. A non-interruptible task has
/// its stop recorded but never surrenders its waiter, which is what keeps
/// uninterruptible waits undisturbed.
pub(crate) fn stop_and_consume_waiter(
    tid: TaskId,
) -> Result<(Arc<TaskMeta>, *mut ButexWaiter), ()> {
    let meta = meta_of(tid).ok_or(())?;
    meta.set_stop();
    let w = {
        // Under the lock the interruptible flag cannot flip, so a slot
        // consumed here never belongs to an uninterruptible wait.
        let _guard = meta.interrupt_lock.lock();
        if !meta.is_interruptible() {
            std::ptr::null_mut()
        } else {
            // Acquire pairs with the waiter's release publication in the
            // wait path.
            meta.current_waiter.swap(std::ptr::null_mut(), Ordering::Acquire)
        }
    };
    Ok((meta, w))
}

/// Hands a consumed waiter back to its task's cancellation slot.
pub(crate) fn set_waiter(meta: &TaskMeta, w: *mut ButexWaiter) {
    meta.current_waiter.store(w, Ordering::Release);
}
