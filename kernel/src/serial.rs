//! Serial port driver for debug output.
//!
//! Drives the 16550 UART on COM1 for early boot debugging and kernel
//! logging. All kernel text ends up here; the text-mode framebuffer is
//! outside this kernel's scope.

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::arch::asm::Port;
use crate::interrupts;

/// Standard COM1 port address.
const SERIAL_IO_PORT: u16 = 0x3f8;

/// Line-status bit: transmit holding register empty.
const LSR_THR_EMPTY: u8 = 0x20;
/// Line-status bit: data ready.
const LSR_DATA_READY: u8 = 0x01;

/// A 16550 UART addressed by its base port.
pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// 38400 baud, 8N1, FIFOs on, interrupts off (the kernel polls).
    fn init(&mut self) {
        unsafe {
            self.int_enable.write(0x00);
            // DLAB on, divisor = 3.
            self.line_ctrl.write(0x80);
            self.data.write(0x03);
            self.int_enable.write(0x00);
            // DLAB off, 8 bits, no parity, one stop bit.
            self.line_ctrl.write(0x03);
            self.fifo_ctrl.write(0xc7);
            self.modem_ctrl.write(0x0b);
        }
    }

    fn send(&mut self, byte: u8) {
        unsafe {
            while self.line_status.read() & LSR_THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            self.data.write(byte);
        }
    }

    fn try_recv(&mut self) -> Option<u8> {
        unsafe {
            if self.line_status.read() & LSR_DATA_READY == 0 {
                None
            } else {
                Some(self.data.read())
            }
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    /// Global serial port instance protected by spinlock.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = SerialPort::new(SERIAL_IO_PORT);
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Initialize serial port (forces the lazy init).
pub fn init() {
    let _ = SERIAL1.lock();
}

/// Print to serial port (internal use).
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // Disable interrupts to prevent deadlock against IRQ-context prints.
    interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// Try to read a byte from serial (non-blocking).
pub fn read_byte() -> Option<u8> {
    interrupts::without_interrupts(|| SERIAL1.lock().try_recv())
}

/// Print to serial port.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to serial port with newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}
