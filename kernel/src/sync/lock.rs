//! Reentrant lock.
//!
//! A binary semaphore plus an owner pointer and a recursion counter. The
//! owner may re-acquire freely; the matching releases unwind the counter
//! and only the last one signals the semaphore. Owner and counter are
//! cleared *before* the `up` so a woken waiter never observes stale
//! ownership.

use core::cell::UnsafeCell;
use core::ptr;

use crate::sync::Semaphore;
use crate::thread::{self, Task};

struct LockInner {
    holder: *mut Task,
    sem: Semaphore,
    holder_repeat_nr: u32,
}

pub struct Lock {
    inner: UnsafeCell<LockInner>,
}

unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

impl Lock {
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(LockInner {
                holder: ptr::null_mut(),
                sem: Semaphore::new(1),
                holder_repeat_nr: 0,
            }),
        }
    }

    /// Link the inner semaphore. Must run once before first use.
    pub fn init(&self) {
        unsafe { (*self.inner.get()).sem.init() };
    }

    pub fn acquire(&self) {
        let inner = unsafe { &mut *self.inner.get() };
        let cur = thread::running_task();
        if inner.holder != cur {
            inner.sem.down();
            inner.holder = cur;
            assert_eq!(inner.holder_repeat_nr, 0);
            inner.holder_repeat_nr = 1;
        } else {
            inner.holder_repeat_nr += 1;
        }
    }

    pub fn release(&self) {
        let inner = unsafe { &mut *self.inner.get() };
        assert!(inner.holder == thread::running_task(), "release by non-owner");
        if inner.holder_repeat_nr > 1 {
            inner.holder_repeat_nr -= 1;
            return;
        }
        assert_eq!(inner.holder_repeat_nr, 1);
        inner.holder = ptr::null_mut();
        inner.holder_repeat_nr = 0;
        inner.sem.up();
    }

    /// Does the running task hold this lock?
    pub fn held_by_current(&self) -> bool {
        unsafe { (*self.inner.get()).holder == thread::running_task() }
    }
}
