//! Thread-path end-to-end scenarios: plain kernel threads blocking on a
//! butex and being woken, timing out, or refusing to block.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use butex::{butex_create, butex_destroy, butex_wait, butex_wake, butex_wake_all, errno};

/// Raw handles are not Send; tests pass them between threads as integers.
fn addr(h: *mut AtomicI32) -> usize {
    h as usize
}

fn handle(addr: usize) -> *mut AtomicI32 {
    addr as *mut AtomicI32
}

/// Wakes until one waiter is actually detached; rides out the window before
/// the waiter has queued itself.
fn wake_one_eventually(h: *mut AtomicI32) {
    loop {
        if unsafe { butex_wake(h) } == 1 {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn producer_consumer_wake() {
    let h = butex_create();
    let ha = addr(h);
    let (tx, rx) = mpsc::channel();
    let consumer = thread::spawn(move || {
        let rc = unsafe { butex_wait(handle(ha), 0, None) };
        tx.send((rc, errno::get_errno())).unwrap();
    });
    thread::sleep(Duration::from_millis(50));
    unsafe { (*h).store(1, Ordering::Release) };
    wake_one_eventually(h);
    let (rc, _) = rx.recv().unwrap();
    assert_eq!(rc, 0);
    consumer.join().unwrap();
    unsafe { butex_destroy(h) };
}

#[test]
fn mismatched_value_refuses_to_block() {
    let h = butex_create();
    unsafe {
        (*h).store(1, Ordering::SeqCst);
        let rc = butex_wait(h, 0, None);
        assert_eq!(rc, -1);
        assert_eq!(errno::get_errno(), errno::EWOULDBLOCK);
        butex_destroy(h);
    }
}

#[test]
fn deadline_expires_within_tolerance() {
    let h = butex_create();
    let start = Instant::now();
    let rc = unsafe { butex_wait(h, 0, Some(start + Duration::from_millis(50))) };
    let elapsed = start.elapsed();
    assert_eq!(rc, -1);
    assert_eq!(errno::get_errno(), errno::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(50), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "woke far too late: {elapsed:?}");
    unsafe { butex_destroy(h) };
}

#[test]
fn wake_one_wakes_exactly_one() {
    let h = butex_create();
    let ha = addr(h);
    let (tx, rx) = mpsc::channel();
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let tx = tx.clone();
            thread::spawn(move || {
                let rc = unsafe { butex_wait(handle(ha), 0, None) };
                tx.send(rc).unwrap();
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(50));
    wake_one_eventually(h);
    assert_eq!(rx.recv().unwrap(), 0);
    // The second waiter stays blocked until its own wake.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    wake_one_eventually(h);
    assert_eq!(rx.recv().unwrap(), 0);
    for w in waiters {
        w.join().unwrap();
    }
    unsafe { butex_destroy(h) };
}

#[test]
fn wake_all_wakes_every_thread_waiter() {
    let h = butex_create();
    let ha = addr(h);
    let (tx, rx) = mpsc::channel();
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let tx = tx.clone();
            thread::spawn(move || {
                let rc = unsafe { butex_wait(handle(ha), 0, None) };
                tx.send(rc).unwrap();
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(80));
    let mut woken = 0;
    while woken < 4 {
        woken += unsafe { butex_wake_all(h) };
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(woken, 4);
    for _ in 0..4 {
        assert_eq!(rx.recv().unwrap(), 0);
    }
    for w in waiters {
        w.join().unwrap();
    }
    unsafe { butex_destroy(h) };
}

#[test]
fn timed_waiter_woken_before_deadline_returns_success() {
    let h = butex_create();
    let ha = addr(h);
    let start = Instant::now();
    let (tx, rx) = mpsc::channel();
    let consumer = thread::spawn(move || {
        let rc =
            unsafe { butex_wait(handle(ha), 0, Some(Instant::now() + Duration::from_secs(5))) };
        tx.send(rc).unwrap();
    });
    thread::sleep(Duration::from_millis(30));
    wake_one_eventually(h);
    assert_eq!(rx.recv().unwrap(), 0);
    assert!(start.elapsed() < Duration::from_secs(4));
    consumer.join().unwrap();
    unsafe { butex_destroy(h) };
}
