//! Fixed-capacity ring between interrupt producers and task consumers.
//!
//! One slot each for a blocked producer and a blocked consumer: `putchar`
//! from IRQ context wakes a waiting reader, `getchar` from task context
//! wakes a waiting writer. The internal lock only arbitrates between
//! tasks; the IRQ path cannot be preempted by another interrupt on the
//! same line, so it touches the indices bare.

use core::cell::UnsafeCell;
use core::ptr;

use crate::interrupts;
use crate::sync::Lock;
use crate::thread::{self, Task, TaskStatus};

pub const BUF_SIZE: usize = 64;

/// Next ring position after `pos`.
const fn next_pos(pos: usize) -> usize {
    (pos + 1) % BUF_SIZE
}

struct IoQueueInner {
    /// Task asleep because the ring was full, if any.
    producer: *mut Task,
    /// Task asleep because the ring was empty, if any.
    consumer: *mut Task,
    buf: [u8; BUF_SIZE],
    /// Write position.
    head: usize,
    /// Read position.
    tail: usize,
}

pub struct IoQueue {
    lock: Lock,
    inner: UnsafeCell<IoQueueInner>,
}

unsafe impl Send for IoQueue {}
unsafe impl Sync for IoQueue {}

impl IoQueue {
    pub const fn new() -> Self {
        Self {
            lock: Lock::new(),
            inner: UnsafeCell::new(IoQueueInner {
                producer: ptr::null_mut(),
                consumer: ptr::null_mut(),
                buf: [0; BUF_SIZE],
                head: 0,
                tail: 0,
            }),
        }
    }

    pub fn init(&self) {
        self.lock.init();
    }

    fn inner(&self) -> &mut IoQueueInner {
        unsafe { &mut *self.inner.get() }
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner();
        inner.head == inner.tail
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner();
        next_pos(inner.head) == inner.tail
    }

    /// Record the caller in `slot` and park it.
    fn wait(slot: &mut *mut Task) {
        assert!(slot.is_null());
        *slot = thread::running_task();
        thread::block(TaskStatus::Blocked);
    }

    /// Wake the task recorded in `slot` and clear it.
    fn wakeup(slot: &mut *mut Task) {
        assert!(!slot.is_null());
        thread::unblock(*slot);
        *slot = ptr::null_mut();
    }

    /// Take one byte; blocks while the ring is empty.
    pub fn getchar(&self) -> u8 {
        while self.is_empty() {
            self.lock.acquire();
            Self::wait(&mut self.inner().consumer);
            self.lock.release();
        }

        let old = interrupts::disable();
        let inner = self.inner();
        let byte = inner.buf[inner.tail];
        inner.tail = next_pos(inner.tail);
        if !inner.producer.is_null() {
            Self::wakeup(&mut inner.producer);
        }
        interrupts::set_status(old);
        byte
    }

    /// Store one byte; blocks while the ring is full. IRQ-context callers
    /// must check `is_full` first — the scan-code decoder does.
    pub fn putchar(&self, byte: u8) {
        while self.is_full() {
            self.lock.acquire();
            Self::wait(&mut self.inner().producer);
            self.lock.release();
        }

        let old = interrupts::disable();
        let inner = self.inner();
        inner.buf[inner.head] = byte;
        inner.head = next_pos(inner.head);
        if !inner.consumer.is_null() {
            Self::wakeup(&mut inner.consumer);
        }
        interrupts::set_status(old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_and_reserves_one_slot() {
        assert_eq!(next_pos(0), 1);
        assert_eq!(next_pos(BUF_SIZE - 1), 0);
        // head == tail is empty, so capacity is BUF_SIZE - 1.
        let mut head = 0;
        let tail = 0;
        let mut stored = 0;
        while next_pos(head) != tail {
            head = next_pos(head);
            stored += 1;
        }
        assert_eq!(stored, BUF_SIZE - 1);
    }

    #[test]
    fn fifo_order_via_indices() {
        let q = IoQueue::new();
        let inner = q.inner();
        // Drive the index machinery directly; blocking paths need a live
        // scheduler.
        for byte in 0x41..0x61u8 {
            assert!(!q.is_full());
            inner.buf[inner.head] = byte;
            inner.head = next_pos(inner.head);
        }
        let mut got = Vec::new();
        while !q.is_empty() {
            got.push(inner.buf[inner.tail]);
            inner.tail = next_pos(inner.tail);
        }
        let want: Vec<u8> = (0x41..0x61).collect();
        assert_eq!(got, want);
        assert!(q.is_empty());
    }
}
