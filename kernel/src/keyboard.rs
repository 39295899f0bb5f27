//! PS/2 keyboard: scan-code decoding into the console ring.
//!
//! The IRQ handler translates set-1 make/break codes, tracks the modifier
//! state machine (shift, ctrl, alt, caps-lock, 0xe0 extensions) and feeds
//! decoded ASCII into the [`IoQueue`] that `sys_read` on stdin drains.
//! Unmapped keys decode to 0 and are dropped.

use crate::arch::asm::Port;
use crate::arch::trap::IntrFrame;
use crate::interrupts::{self, IRQ_KEYBOARD};
use crate::ioqueue::IoQueue;

const KBD_DATA_PORT: u16 = 0x60;

const ESC: u8 = 0x1b;
const BACKSPACE: u8 = 0x08;
const TAB: u8 = 0x09;
const ENTER: u8 = 0x0d;

const EXT_PREFIX: u8 = 0xe0;

// Make codes of the modifier keys.
const CTRL_MAKE: u8 = 0x1d;
const SHIFT_L_MAKE: u8 = 0x2a;
const SHIFT_R_MAKE: u8 = 0x36;
const ALT_MAKE: u8 = 0x38;
const CAPS_MAKE: u8 = 0x3a;

/// (plain, shifted) pairs indexed by make code, through caps-lock (0x3a).
static KEYMAP: [[u8; 2]; 0x3b] = [
    [0, 0],
    [ESC, ESC],
    [b'1', b'!'],
    [b'2', b'@'],
    [b'3', b'#'],
    [b'4', b'$'],
    [b'5', b'%'],
    [b'6', b'^'],
    [b'7', b'&'],
    [b'8', b'*'],
    [b'9', b'('],
    [b'0', b')'],
    [b'-', b'_'],
    [b'=', b'+'],
    [BACKSPACE, BACKSPACE],
    [TAB, TAB],
    [b'q', b'Q'],
    [b'w', b'W'],
    [b'e', b'E'],
    [b'r', b'R'],
    [b't', b'T'],
    [b'y', b'Y'],
    [b'u', b'U'],
    [b'i', b'I'],
    [b'o', b'O'],
    [b'p', b'P'],
    [b'[', b'{'],
    [b']', b'}'],
    [ENTER, ENTER],
    [0, 0], // left ctrl
    [b'a', b'A'],
    [b's', b'S'],
    [b'd', b'D'],
    [b'f', b'F'],
    [b'g', b'G'],
    [b'h', b'H'],
    [b'j', b'J'],
    [b'k', b'K'],
    [b'l', b'L'],
    [b';', b':'],
    [b'\'', b'"'],
    [b'`', b'~'],
    [0, 0], // left shift
    [b'\\', b'|'],
    [b'z', b'Z'],
    [b'x', b'X'],
    [b'c', b'C'],
    [b'v', b'V'],
    [b'b', b'B'],
    [b'n', b'N'],
    [b'm', b'M'],
    [b',', b'<'],
    [b'.', b'>'],
    [b'/', b'?'],
    [0, 0], // right shift
    [b'*', b'*'],
    [0, 0], // left alt
    [b' ', b' '],
    [0, 0], // caps lock
];

#[derive(Default)]
struct ModState {
    ctrl: bool,
    shift: bool,
    alt: bool,
    caps: bool,
    ext: bool,
}

struct StateCell(core::cell::UnsafeCell<ModState>);
// Touched only from the keyboard IRQ, which cannot nest with itself.
unsafe impl Sync for StateCell {}

static STATE: StateCell = StateCell(core::cell::UnsafeCell::new(ModState {
    ctrl: false,
    shift: false,
    alt: false,
    caps: false,
    ext: false,
}));

/// Ring drained by stdin readers.
static KBD_BUF: IoQueue = IoQueue::new();

/// Effective shift for a make code given the modifier state: letters honor
/// caps-lock (which shift inverts), everything else honors shift alone.
fn effective_shift(make: u8, shift: bool, caps: bool) -> bool {
    let letter = matches!(make, 0x10..=0x19 | 0x1e..=0x26 | 0x2c..=0x32);
    if letter {
        shift ^ caps
    } else {
        shift
    }
}

/// Translate a make code under the given shift decision; 0 if unmapped.
fn translate(make: u8, shift: bool) -> u8 {
    if (make as usize) < KEYMAP.len() {
        KEYMAP[make as usize][shift as usize]
    } else {
        0
    }
}

fn intr_keyboard_handler(_vec: u8, _frame: &mut IntrFrame) {
    let scancode = unsafe { Port::<u8>::new(KBD_DATA_PORT).read() };
    let state = unsafe { &mut *STATE.0.get() };

    if scancode == EXT_PREFIX {
        state.ext = true;
        return;
    }
    // Extended keys (right ctrl/alt) share the base make codes.
    state.ext = false;

    let breaking = scancode & 0x80 != 0;
    let make = scancode & 0x7f;

    if breaking {
        match make {
            CTRL_MAKE => state.ctrl = false,
            SHIFT_L_MAKE | SHIFT_R_MAKE => state.shift = false,
            ALT_MAKE => state.alt = false,
            _ => {}
        }
        return;
    }

    match make {
        CTRL_MAKE => {
            state.ctrl = true;
            return;
        }
        SHIFT_L_MAKE | SHIFT_R_MAKE => {
            state.shift = true;
            return;
        }
        ALT_MAKE => {
            state.alt = true;
            return;
        }
        CAPS_MAKE => {
            state.caps = !state.caps;
            return;
        }
        _ => {}
    }

    let mut ch = translate(make, effective_shift(make, state.shift, state.caps));
    if ch == 0 {
        return;
    }
    // ctrl-l / ctrl-u reach readers as control bytes (shell line editing).
    if state.ctrl && (ch == b'l' || ch == b'u') {
        ch -= b'a' - 1;
    }
    // IRQ context must never block on the ring.
    if !KBD_BUF.is_full() {
        KBD_BUF.putchar(ch);
    }
}

/// Blocking read of one decoded keystroke.
pub fn getchar() -> u8 {
    KBD_BUF.getchar()
}

pub fn init() {
    KBD_BUF.init();
    interrupts::register_handler(IRQ_KEYBOARD, intr_keyboard_handler);
    crate::log!("[KBD] scan-code decoder armed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_shifted_pairs() {
        assert_eq!(translate(0x1e, false), b'a');
        assert_eq!(translate(0x1e, true), b'A');
        assert_eq!(translate(0x02, false), b'1');
        assert_eq!(translate(0x02, true), b'!');
        assert_eq!(translate(0x1c, false), ENTER);
    }

    #[test]
    fn caps_only_affects_letters() {
        // Letter: caps acts like shift, and shift undoes caps.
        assert!(effective_shift(0x1e, false, true));
        assert!(!effective_shift(0x1e, true, true));
        // Digit row ignores caps.
        assert!(!effective_shift(0x02, false, true));
        assert!(effective_shift(0x02, true, false));
    }

    #[test]
    fn modifiers_do_not_decode() {
        assert_eq!(translate(CTRL_MAKE, false), 0);
        assert_eq!(translate(SHIFT_L_MAKE, false), 0);
        assert_eq!(translate(CAPS_MAKE, false), 0);
    }
}
