//! Programmable interval timer and tick accounting.
//!
//! Counter 0 of the 8253 runs in rate-generator mode at 100 Hz. The tick
//! handler burns the running task's quantum and hands control to the
//! scheduler when it hits zero. Sleeps are tick-quantized: 10 ms
//! resolution, rounded up.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::asm::Port;
use crate::arch::trap::IntrFrame;
use crate::interrupts::{self, IRQ_TIMER};
use crate::memory::div_round_up;
use crate::thread;

/// Tick frequency.
pub const TICK_HZ: u32 = 100;
const PIT_INPUT_HZ: u32 = 1_193_180;
const COUNTER0_VALUE: u16 = (PIT_INPUT_HZ / TICK_HZ) as u16;

const COUNTER0_PORT: u16 = 0x40;
const PIT_CONTROL_PORT: u16 = 0x43;
/// Control word: counter 0, lobyte/hibyte latch, mode 2, binary.
const COUNTER0_CONTROL: u8 = 0b0011_0100;

const MS_PER_TICK: u32 = 1000 / TICK_HZ;

/// Ticks since the first timer interrupt.
static TICKS: AtomicU32 = AtomicU32::new(0);

pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Timer tick: account, then preempt if the quantum is spent. Runs with
/// interrupts masked by the CPU.
fn intr_timer_handler(_vec: u8, _frame: &mut IntrFrame) {
    let cur = thread::running_task();
    unsafe {
        assert!((*cur).stack_guard_ok(), "kernel stack overflow");
        (*cur).elapsed_ticks += 1;
        TICKS.fetch_add(1, Ordering::Relaxed);
        if (*cur).ticks == 0 {
            thread::schedule();
        } else {
            (*cur).ticks -= 1;
        }
    }
}

/// Yield until `sleep_ticks` ticks have elapsed.
fn ticks_to_sleep(sleep_ticks: u32) {
    let start = ticks();
    while ticks().wrapping_sub(start) < sleep_ticks {
        thread::yield_now();
    }
}

/// Sleep for at least `ms` milliseconds (rounded up to whole ticks).
pub fn mtime_sleep(ms: u32) {
    let sleep_ticks = div_round_up(ms as usize, MS_PER_TICK as usize) as u32;
    assert!(sleep_ticks > 0);
    ticks_to_sleep(sleep_ticks);
}

/// Program the PIT and claim the timer vector.
pub fn init() {
    let mut control = Port::<u8>::new(PIT_CONTROL_PORT);
    let mut counter0 = Port::<u8>::new(COUNTER0_PORT);
    unsafe {
        control.write(COUNTER0_CONTROL);
        counter0.write((COUNTER0_VALUE & 0xff) as u8);
        counter0.write((COUNTER0_VALUE >> 8) as u8);
    }
    interrupts::register_handler(IRQ_TIMER, intr_timer_handler);
    crate::log!("[TIMER] PIT counter0 = {} ({} Hz)", COUNTER0_VALUE, TICK_HZ);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_matches_tick_rate() {
        assert_eq!(COUNTER0_VALUE, 11931);
    }

    #[test]
    fn sleep_rounds_up_to_ticks() {
        assert_eq!(div_round_up(1, MS_PER_TICK as usize), 1);
        assert_eq!(div_round_up(10, MS_PER_TICK as usize), 1);
        assert_eq!(div_round_up(11, MS_PER_TICK as usize), 2);
    }
}
