//! Default exception handling.
//!
//! Every vector starts out pointing at [`general_handler`], which names the
//! exception, dumps the frame and halts: undefined internal state in kernel
//! code is not recoverable at this level. The page-fault path additionally
//! reports the faulting address from `cr2` — there is no demand paging.

use crate::arch::asm;
use crate::arch::trap::IntrFrame;
use crate::interrupts::IntrStatus;

/// Exception mnemonics for vectors 0–31.
static EXCEPTION_NAMES: [&str; 32] = [
    "#DE Divide Error",
    "#DB Debug Exception",
    "NMI Interrupt",
    "#BP Breakpoint Exception",
    "#OF Overflow Exception",
    "#BR BOUND Range Exceeded Exception",
    "#UD Invalid Opcode Exception",
    "#NM Device Not Available Exception",
    "#DF Double Fault Exception",
    "Coprocessor Segment Overrun",
    "#TS Invalid TSS Exception",
    "#NP Segment Not Present",
    "#SS Stack Fault Exception",
    "#GP General Protection Exception",
    "#PF Page-Fault Exception",
    "(reserved)",
    "#MF x87 FPU Floating-Point Error",
    "#AC Alignment Check Exception",
    "#MC Machine-Check Exception",
    "#XF SIMD Floating-Point Exception",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
    "(reserved)",
];

pub fn vector_name(vec: u8) -> &'static str {
    if (vec as usize) < EXCEPTION_NAMES.len() {
        EXCEPTION_NAMES[vec as usize]
    } else {
        "unknown"
    }
}

/// Catch-all handler: print and halt.
pub fn general_handler(vec: u8, frame: &mut IntrFrame) {
    // IRQ7 and IRQ15 fire spuriously on the 8259A; ignore them.
    if vec == 0x27 || vec == 0x2f {
        return;
    }

    crate::interrupts::disable();
    crate::serial_println!("\n!!! EXCEPTION !!!");
    crate::serial_println!("vector {:#04x}: {}", vec, vector_name(vec));
    crate::serial_println!(
        "eip={:#010x} cs={:#06x} eflags={:#010x} err={:#x}",
        frame.eip,
        frame.cs,
        frame.eflags,
        frame.err_code
    );
    if vec == 0x0e {
        crate::serial_println!("page fault addr: {:#010x}", asm::read_cr2());
    }
    loop {
        asm::hlt();
    }
}

/// Install the defaults. The table is born pointing at `general_handler`;
/// nothing to do beyond asserting we boot with interrupts masked.
pub fn init() {
    assert_eq!(crate::interrupts::get_status(), IntrStatus::Off);
}
