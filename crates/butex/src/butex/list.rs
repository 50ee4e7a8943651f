//! Intrusive doubly-linked waiter list.
//!
//! Nodes live on waiter stacks; the list only stores pointers, so queueing
//! allocates nothing and removal from the middle is O(1). Every operation
//! on a butex's list happens under that butex's waiter lock; detached
//! batches are private to the detaching thread.

use std::ptr;

use super::ButexWaiter;

pub(crate) struct WaiterList {
    head: *mut ButexWaiter,
    tail: *mut ButexWaiter,
}

// SAFETY: the list is either owned by one thread or guarded by the butex
// waiter lock; the raw pointers are never followed without that protection.
unsafe impl Send for WaiterList {}

impl WaiterList {
    pub(crate) const fn new() -> WaiterList {
        WaiterList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Appends `w` in arrival order.
    ///
    /// # Safety
    ///
    /// `w` must point to a live waiter that is not on any list.
    pub(crate) unsafe fn push_back(&mut self, w: *mut ButexWaiter) {
        // SAFETY: caller guarantees `w` is live and unlinked.
        unsafe {
            (*w).prev = self.tail;
            (*w).next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = w;
            } else {
                (*self.tail).next = w;
            }
        }
        self.tail = w;
    }

    /// Detaches and returns the oldest waiter, or null when empty.
    pub(crate) fn pop_front(&mut self) -> *mut ButexWaiter {
        let w = self.head;
        if !w.is_null() {
            // SAFETY: `w` is on this list, so it is live.
            unsafe { self.remove(w) };
        }
        w
    }

    /// Unlinks `w` from this list.
    ///
    /// # Safety
    ///
    /// `w` must be a live member of this list.
    pub(crate) unsafe fn remove(&mut self, w: *mut ButexWaiter) {
        // SAFETY: caller guarantees membership; neighbours are therefore
        // live list nodes.
        unsafe {
            let prev = (*w).prev;
            let next = (*w).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*w).prev = ptr::null_mut();
            (*w).next = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tid: u64) -> ButexWaiter {
        ButexWaiter::new(tid)
    }

    #[test]
    fn pops_in_arrival_order() {
        let mut a = node(1);
        let mut b = node(2);
        let mut c = node(3);
        let mut list = WaiterList::new();
        assert!(list.is_empty());
        unsafe {
            list.push_back(&mut a);
            list.push_back(&mut b);
            list.push_back(&mut c);
        }
        assert!(!list.is_empty());
        let popped: Vec<u64> = std::iter::from_fn(|| {
            let w = list.pop_front();
            // SAFETY: `w` came off the list and the nodes are on this stack.
            (!w.is_null()).then(|| unsafe { (*w).tid })
        })
        .collect();
        assert_eq!(popped, vec![1, 2, 3]);
        assert!(list.is_empty());
    }

    #[test]
    fn pop_on_empty_returns_null() {
        let mut list = WaiterList::new();
        assert!(list.pop_front().is_null());
    }

    #[test]
    fn removes_from_middle_head_and_tail() {
        let mut a = node(1);
        let mut b = node(2);
        let mut c = node(3);
        let mut list = WaiterList::new();
        unsafe {
            list.push_back(&mut a);
            list.push_back(&mut b);
            list.push_back(&mut c);
            list.remove(&mut b);
        }
        assert_eq!(unsafe { (*list.pop_front()).tid }, 1);
        assert_eq!(unsafe { (*list.pop_front()).tid }, 3);
        assert!(list.is_empty());

        unsafe {
            list.push_back(&mut a);
            list.push_back(&mut b);
            list.remove(&mut a); // head
            list.remove(&mut b); // tail, now also head
        }
        assert!(list.is_empty());
    }

    #[test]
    fn single_element_list_round_trip() {
        let mut a = node(7);
        let mut list = WaiterList::new();
        unsafe { list.push_back(&mut a) };
        let w = list.pop_front();
        assert_eq!(unsafe { (*w).tid }, 7);
        assert!(list.is_empty());
        assert!(list.pop_front().is_null());
    }
}
