//! Deadline timer service.
//!
//! One worker thread runs callbacks at absolute deadlines. The contract the
//! waiting code relies on is the `unschedule` answer: a pending entry can be
//! cancelled before it runs, a running one must be spun out (its callback
//! may still be touching the caller's stack), and a finished one is safe to
//! forget.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Timer task identifier; 0 is never issued and means "no timer".
pub type TimerId = u64;

/// Callback invoked on the timer thread when a deadline is reached.
pub type TimerCallback = unsafe fn(*mut ());

/// Outcome of [`TimerThread::unschedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unschedule {
    /// Removed before it ran; the callback will never execute.
    Cancelled,
    /// The callback is executing right now; retry until it is not.
    Running,
    /// The callback already completed (or the id was never live).
    Finished,
}

/// Raw pointer argument carried across to the timer thread.
///
/// The scheduling side guarantees the pointee outlives the callback (waiters
/// spin out running callbacks before unwinding their stacks).
struct SendPtr(*mut ());

// SAFETY: see SendPtr; lifetime discipline is the scheduler's contract.
unsafe impl Send for SendPtr {}

enum EntryState {
    Pending { callback: TimerCallback, arg: SendPtr },
    Running,
}

struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, EntryState>,
    next_id: TimerId,
    stopped: bool,
}

struct Inner {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// The timer worker and its schedule.
pub struct TimerThread {
    inner: Arc<Inner>,
    worker: Option<thread::JoinHandle<()>>,
}

impl TimerThread {
    pub fn new() -> std::io::Result<TimerThread> {
        let inner = Arc::new(Inner {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                entries: HashMap::new(),
                next_id: 1,
                stopped: false,
            }),
            condvar: Condvar::new(),
        });
        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || run_worker(&worker_inner))?;
        Ok(TimerThread {
            inner,
            worker: Some(worker),
        })
    }

    /// Schedules `callback(arg)` at `deadline`. Returns 0 when the timer has
    /// been stopped.
    ///
    /// # Safety
    ///
    /// `arg` must stay valid until the callback completes or the entry is
    /// unscheduled with a [`Unschedule::Cancelled`] answer.
    pub unsafe fn schedule(
        &self,
        callback: TimerCallback,
        arg: *mut (),
        deadline: Instant,
    ) -> TimerId {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return 0;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            EntryState::Pending {
                callback,
                arg: SendPtr(arg),
            },
        );
        state.queue.push(Reverse((deadline, id)));
        drop(state);
        self.inner.condvar.notify_one();
        id
    }

    /// Removes a scheduled entry if it has not run yet.
    pub fn unschedule(&self, id: TimerId) -> Unschedule {
        let mut state = self.inner.state.lock();
        let answer = match state.entries.get(&id) {
            Some(EntryState::Pending { .. }) => Unschedule::Cancelled,
            Some(EntryState::Running) => Unschedule::Running,
            None => Unschedule::Finished,
        };
        if answer == Unschedule::Cancelled {
            // The heap entry becomes stale and is skipped by the worker.
            state.entries.remove(&id);
        }
        answer
    }

    /// Stops accepting work and joins the worker thread.
    pub fn stop_and_join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
        }
        self.inner.condvar.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

fn run_worker(inner: &Inner) {
    let mut state = inner.state.lock();
    loop {
        // Drop stale heads (unscheduled entries leave their heap slot).
        while let Some(&Reverse((deadline, id))) = state.queue.peek() {
            if !state.entries.contains_key(&id) {
                state.queue.pop();
                continue;
            }
            let now = Instant::now();
            if deadline > now {
                break;
            }
            state.queue.pop();
            let Some(EntryState::Pending { callback, arg }) =
                state.entries.insert(id, EntryState::Running)
            else {
                // Stale or raced with unschedule; undo the marker.
                state.entries.remove(&id);
                continue;
            };
            drop(state);
            // SAFETY: the scheduling side keeps `arg` alive while the entry
            // is Pending or Running.
            unsafe { callback(arg.0) };
            state = inner.state.lock();
            state.entries.remove(&id);
        }
        if state.stopped {
            return;
        }
        match state.queue.peek() {
            Some(&Reverse((deadline, _))) => {
                let _ = inner.condvar.wait_until(&mut state, deadline);
            }
            None => {
                inner.condvar.wait(&mut state);
            }
        }
    }
}

/// The process-wide timer used for butex deadlines. Leaky by design.
pub fn global_timer() -> &'static TimerThread {
    static GLOBAL: OnceLock<TimerThread> = OnceLock::new();
    GLOBAL.get_or_init(|| TimerThread::new().expect("failed to start timer thread"))
}
