//! Requeue: condition-variable-style broadcast without a thundering herd.
//! One waiter is woken, the rest move to the second butex wholesale.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use butex::{butex_create, butex_destroy, butex_requeue, butex_wait, butex_wake_all, task};

fn addr(h: *mut AtomicI32) -> usize {
    h as usize
}

fn handle(addr: usize) -> *mut AtomicI32 {
    addr as *mut AtomicI32
}

#[test]
fn broadcast_requeue_moves_all_but_the_head() {
    let h1 = butex_create();
    let h2 = butex_create();
    let (a1, a2) = (addr(h1), addr(h2));
    let ready = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let ready = ready.clone();
            let completed = completed.clone();
            task::spawn(move || {
                ready.fetch_add(1, Ordering::SeqCst);
                let rc = unsafe { butex_wait(handle(a1), 0, None) };
                assert_eq!(rc, 0);
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();

    while ready.load(Ordering::SeqCst) < 10 {
        thread::sleep(Duration::from_millis(5));
    }
    // Everyone announced themselves; give the last enqueues time to land.
    thread::sleep(Duration::from_millis(300));

    let woken = unsafe { butex_requeue(handle(a1), handle(a2)) };
    assert_eq!(woken, 1);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    // The other nine now belong to h2.
    let moved = unsafe { butex_wake_all(handle(a2)) };
    assert_eq!(moved, 9);
    for t in tasks {
        t.join().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 10);
    unsafe {
        butex_destroy(h1);
        butex_destroy(h2);
    }
}

#[test]
fn requeue_wakes_a_thread_waiter_at_the_head() {
    let h1 = butex_create();
    let h2 = butex_create();
    let (a1, a2) = (addr(h1), addr(h2));
    let completed = Arc::new(AtomicUsize::new(0));

    let completed_thread = completed.clone();
    let thread_waiter = thread::spawn(move || {
        let rc = unsafe { butex_wait(handle(a1), 0, None) };
        assert_eq!(rc, 0);
        completed_thread.fetch_add(1, Ordering::SeqCst);
    });
    thread::sleep(Duration::from_millis(50));

    let completed_task = completed.clone();
    let task_waiter = task::spawn(move || {
        let rc = unsafe { butex_wait(handle(a1), 0, None) };
        assert_eq!(rc, 0);
        completed_task.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    thread::sleep(Duration::from_millis(100));

    // The thread waiter arrived first, so it is the one woken.
    assert_eq!(unsafe { butex_requeue(handle(a1), handle(a2)) }, 1);
    thread_waiter.join().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    assert_eq!(unsafe { butex_wake_all(handle(a2)) }, 1);
    task_waiter.join().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 2);
    unsafe {
        butex_destroy(h1);
        butex_destroy(h2);
    }
}
