//! Kernel console.
//!
//! Serializes task-context output behind one reentrant lock so concurrent
//! writers cannot interleave mid-line, and backs the stdout/stderr side of
//! `sys_write` plus the stdin side of `sys_read` (via the keyboard ring).
//! The sink is the serial port; driving the VGA text buffer is outside this
//! kernel's scope.

use core::fmt;

use crate::keyboard;
use crate::sync::Lock;

static CONSOLE_LOCK: Lock = Lock::new();

pub fn init() {
    CONSOLE_LOCK.init();
}

pub fn acquire() {
    CONSOLE_LOCK.acquire();
}

pub fn release() {
    CONSOLE_LOCK.release();
}

/// Write raw bytes under the console lock; the stdout/stderr sink.
pub fn write(buf: &[u8]) -> usize {
    acquire();
    for &byte in buf {
        if byte == b'\n' {
            crate::serial_print!("\n");
        } else {
            crate::serial_print!("{}", byte as char);
        }
    }
    release();
    buf.len()
}

/// Blocking stdin read: decoded keystrokes from the keyboard ring.
pub fn read(buf: &mut [u8]) -> usize {
    for slot in buf.iter_mut() {
        *slot = keyboard::getchar();
    }
    buf.len()
}

/// ANSI clear for the serial console.
pub fn clear() {
    acquire();
    crate::serial_print!("\x1b[2J\x1b[H");
    release();
}

/// Print under the console lock (internal use).
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    acquire();
    crate::serial::_print(args);
    release();
}

/// Print to the console.
#[macro_export]
macro_rules! console_print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

/// Print to the console with newline.
#[macro_export]
macro_rules! console_println {
    () => ($crate::console_print!("\n"));
    ($fmt:expr) => ($crate::console_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::console_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}
