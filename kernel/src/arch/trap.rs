//! Interrupt entry and exit.
//!
//! Every populated vector gets a tiny stub that normalizes the stack (the
//! CPU pushes an error code for some exceptions, the stubs push a zero for
//! the rest), records the vector number and falls into a common entry that
//! saves the full register file as an [`IntrFrame`]. The common entry calls
//! `intr_dispatch(vec, frame)`; `intr_exit` is the exact inverse and is also
//! the launch pad for freshly forked children and new user processes, whose
//! kernel stacks are seeded with a hand-built frame.

/// Register file captured at interrupt entry, lowest address first.
///
/// Field order mirrors the push sequence in `intr_common` below: `pushad`,
/// the data segment registers, the vector number and error code pushed by
/// the stub, then the hardware frame. The last two slots exist only when the
/// interrupt crossed from ring 3.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IntrFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub vec_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

/// Byte offset of `vec_no` inside [`IntrFrame`]; the common entry reads the
/// vector back off the stack at this offset.
#[allow(dead_code)]
const VEC_NO_OFFSET: usize = 48;

#[cfg(target_arch = "x86")]
macro_rules! intr_stub {
    // CPU pushed no error code: push a placeholder to keep the frame shape.
    ($name:ident, $vec:literal) => {
        core::arch::global_asm!(concat!(
            ".global ", stringify!($name), "\n",
            stringify!($name), ":\n",
            "    push 0\n",
            "    push ", stringify!($vec), "\n",
            "    jmp intr_common\n",
        ));
    };
    // CPU already pushed an error code.
    ($name:ident, $vec:literal, err) => {
        core::arch::global_asm!(concat!(
            ".global ", stringify!($name), "\n",
            stringify!($name), ":\n",
            "    push ", stringify!($vec), "\n",
            "    jmp intr_common\n",
        ));
    };
}

#[cfg(target_arch = "x86")]
// The common entry saves the register file, passes (vector, frame pointer)
// to `intr_dispatch` and falls through into `intr_exit`, which unwinds the
// frame (the final `add` drops the vector number and error code).
core::arch::global_asm!(
    "
    .global intr_common
    intr_common:
        push ds
        push es
        push fs
        push gs
        pushad
        mov eax, esp
        push eax
        push dword ptr [eax + 48]
        call intr_dispatch
        add esp, 8
    .global intr_exit
    intr_exit:
        popad
        pop gs
        pop fs
        pop es
        pop ds
        add esp, 8
        iretd
    "
);

#[cfg(target_arch = "x86")]
macro_rules! intr_stubs {
    ($(($name:ident, $vec:literal $(, $err:ident)?)),+ $(,)?) => {
        $( intr_stub!($name, $vec $(, $err)?); )+
        extern "C" {
            $( fn $name(); )+
        }
        /// (vector, stub) pairs, consumed by the IDT builder.
        pub fn entries() -> &'static [(usize, unsafe extern "C" fn())] {
            &[ $( ($vec, $name as unsafe extern "C" fn()) ),+ ]
        }
    };
}

#[cfg(target_arch = "x86")]
intr_stubs![
    (vector_0x00, 0x00),
    (vector_0x01, 0x01),
    (vector_0x02, 0x02),
    (vector_0x03, 0x03),
    (vector_0x04, 0x04),
    (vector_0x05, 0x05),
    (vector_0x06, 0x06),
    (vector_0x07, 0x07),
    (vector_0x08, 0x08, err),
    (vector_0x09, 0x09),
    (vector_0x0a, 0x0a, err),
    (vector_0x0b, 0x0b, err),
    (vector_0x0c, 0x0c, err),
    (vector_0x0d, 0x0d, err),
    (vector_0x0e, 0x0e, err),
    (vector_0x0f, 0x0f),
    (vector_0x10, 0x10),
    (vector_0x11, 0x11, err),
    (vector_0x12, 0x12),
    (vector_0x13, 0x13),
    (vector_0x14, 0x14),
    (vector_0x15, 0x15),
    (vector_0x16, 0x16),
    (vector_0x17, 0x17),
    (vector_0x18, 0x18),
    (vector_0x19, 0x19),
    (vector_0x1a, 0x1a),
    (vector_0x1b, 0x1b),
    (vector_0x1c, 0x1c),
    (vector_0x1d, 0x1d),
    (vector_0x1e, 0x1e),
    (vector_0x1f, 0x1f),
    (vector_0x20, 0x20),
    (vector_0x21, 0x21),
    (vector_0x22, 0x22),
    (vector_0x23, 0x23),
    (vector_0x24, 0x24),
    (vector_0x25, 0x25),
    (vector_0x26, 0x26),
    (vector_0x27, 0x27),
    (vector_0x28, 0x28),
    (vector_0x29, 0x29),
    (vector_0x2a, 0x2a),
    (vector_0x2b, 0x2b),
    (vector_0x2c, 0x2c),
    (vector_0x2d, 0x2d),
    (vector_0x2e, 0x2e),
    (vector_0x2f, 0x2f),
    (vector_0x80, 0x80),
];

#[cfg(target_arch = "x86")]
extern "C" {
    /// Restore an [`IntrFrame`] and `iretd`. Jumped to with `esp` pointing
    /// at the frame's `edi` slot; never returns to the jumper.
    pub fn intr_exit();
}

#[cfg(not(target_arch = "x86"))]
pub fn entries() -> &'static [(usize, unsafe extern "C" fn())] {
    &[]
}

#[cfg(not(target_arch = "x86"))]
pub unsafe extern "C" fn intr_exit() {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_matches_entry_pushes() {
        assert_eq!(offset_of!(IntrFrame, vec_no), VEC_NO_OFFSET);
        assert_eq!(offset_of!(IntrFrame, err_code), 52);
        assert_eq!(offset_of!(IntrFrame, eip), 56);
        assert_eq!(offset_of!(IntrFrame, user_ss), 72);
        assert_eq!(size_of::<IntrFrame>(), 76);
    }
}
