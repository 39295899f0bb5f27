//! Programmable Interrupt Controller (8259 PIC).
//!
//! Remaps the chained pair to vectors 0x20–0x2f and unmasks only the lines
//! this kernel drives: timer, keyboard, the cascade and both IDE channels.

use spin::Mutex;

use crate::arch::asm::Port;

/// PIC1 command port.
const PIC1_COMMAND: u16 = 0x20;
/// PIC1 data port.
const PIC1_DATA: u16 = 0x21;
/// PIC2 command port.
const PIC2_COMMAND: u16 = 0xa0;
/// PIC2 data port.
const PIC2_DATA: u16 = 0xa1;

/// End of interrupt command.
const PIC_EOI: u8 = 0x20;

/// PIC1 offset in IDT.
const PIC1_OFFSET: u8 = 0x20;
/// PIC2 offset in IDT.
const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

/// Chained PIC controller.
pub struct ChainedPics {
    pics: [Pic; 2],
}

impl ChainedPics {
    pub const fn new() -> Self {
        Self {
            pics: [
                Pic::new(PIC1_COMMAND, PIC1_DATA, PIC1_OFFSET),
                Pic::new(PIC2_COMMAND, PIC2_DATA, PIC2_OFFSET),
            ],
        }
    }

    /// Initialize both PICs.
    pub unsafe fn initialize(&mut self) {
        // ICW1: start initialization sequence, ICW4 follows.
        self.pics[0].command.write(0x11);
        self.pics[1].command.write(0x11);

        // ICW2: set vector offsets.
        self.pics[0].data.write(self.pics[0].offset);
        self.pics[1].data.write(self.pics[1].offset);

        // ICW3: slave on master IR2; slave cascade identity 2.
        self.pics[0].data.write(0x04);
        self.pics[1].data.write(0x02);

        // ICW4: 8086 mode, manual EOI.
        self.pics[0].data.write(0x01);
        self.pics[1].data.write(0x01);

        // Masks: IRQ0 (timer), IRQ1 (keyboard), IRQ2 (cascade) on the
        // master; IRQ14/IRQ15 (the two IDE channels) on the slave.
        self.pics[0].data.write(0xf8);
        self.pics[1].data.write(0x3f);
    }

    /// Notify end of interrupt for `vec` (an already-remapped vector).
    pub unsafe fn notify_end_of_interrupt(&mut self, vec: u8) {
        if vec >= self.pics[1].offset {
            self.pics[1].command.write(PIC_EOI);
        }
        self.pics[0].command.write(PIC_EOI);
    }
}

/// Single PIC controller.
struct Pic {
    command: Port<u8>,
    data: Port<u8>,
    offset: u8,
}

impl Pic {
    const fn new(command_port: u16, data_port: u16, offset: u8) -> Self {
        Self {
            command: Port::new(command_port),
            data: Port::new(data_port),
            offset,
        }
    }
}

/// Global PIC instance.
static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new());

pub fn init() {
    unsafe {
        PICS.lock().initialize();
    }
}

/// Acknowledge `vec` to the PIC pair. Runs inside the dispatcher with
/// interrupts already masked by the CPU.
pub fn notify_end_of_interrupt(vec: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(vec);
    }
}
