//! Interrupt Handling Subsystem.
//!
//! Builds the 129-vector IDT, programs the 8259A pair and routes every
//! populated vector through a single dispatch table. Drivers claim their
//! vectors with [`register_handler`] at boot; until then every slot points
//! at the generic handler that names the exception and halts.
//!
//! The interrupt-flag helpers return the previous state so callers can
//! follow the disable–mutate–restore discipline used throughout the kernel.

pub mod handlers;
mod idt;
pub mod pic;

pub use crate::arch::trap::IntrFrame;

use core::cell::UnsafeCell;

use crate::arch::asm;

/// Number of IDT vectors: exceptions, the two PIC blocks and 0x80.
pub const IDT_DESC_CNT: usize = 0x81;

/// Vector of the first PIC interrupt after remap (the timer).
pub const IRQ_BASE: u8 = 0x20;
pub const IRQ_TIMER: u8 = 0x20;
pub const IRQ_KEYBOARD: u8 = 0x21;
pub const IRQ_IDE0: u8 = 0x2e;
pub const IRQ_IDE1: u8 = 0x2f;
/// The sole user→kernel gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Interrupt-flag state, as returned by the save/restore helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrStatus {
    Off,
    On,
}

/// Per-vector handler: vector number plus the saved register frame.
pub type IntrHandler = fn(u8, &mut IntrFrame);

struct HandlerTable(UnsafeCell<[IntrHandler; IDT_DESC_CNT]>);

// Written only during single-threaded boot; read from interrupt context.
unsafe impl Sync for HandlerTable {}

static HANDLERS: HandlerTable =
    HandlerTable(UnsafeCell::new([handlers::general_handler as IntrHandler; IDT_DESC_CNT]));

/// Current interrupt-flag state.
pub fn get_status() -> IntrStatus {
    if asm::read_eflags() & asm::EFLAGS_IF != 0 {
        IntrStatus::On
    } else {
        IntrStatus::Off
    }
}

/// Enable interrupts, returning the previous state.
pub fn enable() -> IntrStatus {
    let old = get_status();
    if old == IntrStatus::Off {
        unsafe { asm::sti() };
    }
    old
}

/// Disable interrupts, returning the previous state.
pub fn disable() -> IntrStatus {
    let old = get_status();
    if old == IntrStatus::On {
        unsafe { asm::cli() };
    }
    old
}

/// Force the interrupt flag to `status`, returning the previous state.
pub fn set_status(status: IntrStatus) -> IntrStatus {
    if status == IntrStatus::On {
        enable()
    } else {
        disable()
    }
}

/// Disable interrupts and run closure.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let old = disable();
    let ret = f();
    set_status(old);
    ret
}

/// Replace the handler for `vec`. Called by drivers at boot, before the
/// first `sti`.
pub fn register_handler(vec: u8, handler: IntrHandler) {
    assert!((vec as usize) < IDT_DESC_CNT);
    unsafe {
        (*HANDLERS.0.get())[vec as usize] = handler;
    }
}

/// Common dispatch target of every entry stub.
///
/// Hardware IRQs are acknowledged to the PIC before the handler runs: the
/// timer handler may switch away inside `schedule` and not return here for
/// a long time.
#[no_mangle]
extern "C" fn intr_dispatch(vec: u32, frame: *mut IntrFrame) {
    let vec = vec as u8;
    if (IRQ_BASE..IRQ_BASE + 16).contains(&vec) {
        pic::notify_end_of_interrupt(vec);
    }
    let handler = unsafe { (*HANDLERS.0.get())[vec as usize] };
    handler(vec, unsafe { &mut *frame });
}

/// Load the IDT and program the PICs. Leaves interrupts disabled; `main`
/// enables them once every driver has registered.
pub fn init() {
    handlers::init();
    idt::init();
    pic::init();
    crate::log!("[INTR] IDT loaded, PIC remapped, dispatch table armed");
}
