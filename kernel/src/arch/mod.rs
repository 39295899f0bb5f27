//! CPU-specific plumbing for IA-32.
//!
//! Raw instruction wrappers, descriptor tables, the `switch_to` stack swap
//! and the interrupt entry/exit path. Everything that touches a register or
//! an I/O port lives below this module; the rest of the kernel stays
//! architecture-silent.

pub mod asm;
pub mod gdt;
pub mod switch;
pub mod trap;
