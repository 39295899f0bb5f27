//! RuneOS kernel.
//!
//! A small 32-bit protected-mode kernel for the x86: paged two-pool memory
//! with an arena heap, preemptive priority-quantum threads and user
//! processes, interrupt-driven ATA storage, a UNIX-style inode file system
//! and an `int 0x80` syscall surface.
//!
//! The bootloader hands control here in protected mode with paging on, the
//! first megabyte identity-mapped and aliased at 3 GiB, and the BIOS
//! memory/disk facts parked at their fixed low addresses.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

// Infrastructure
mod arch;
mod bitmap;
mod list;
mod logger;
mod serial;

// Core subsystems
mod console;
mod fork;
mod fs;
mod ide;
mod interrupts;
mod ioqueue;
mod keyboard;
mod memory;
mod process;
mod sync;
mod syscall;
mod thread;
mod timer;

#[cfg(not(test))]
use core::panic::PanicInfo;

/// Kernel entry, jumped to by the loader.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    kernel_main()
}

fn kernel_main() -> ! {
    serial::init();
    serial_println!();
    serial_println!("RuneOS kernel booting");

    init_all();

    let (passed, failed) = memory::self_test();
    if failed == 0 {
        log!("[SELFTEST] memory: {} checks passed", passed);
    } else {
        log_error!("[SELFTEST] memory: {} passed, {} FAILED", passed, failed);
    }

    // Hand the machine to user space when an init program is on disk.
    if fs::is_mounted() && fs::sys_stat("/init").is_ok() {
        process::execute("/init", "init");
        log!("[KERNEL] /init scheduled");
    } else {
        log!("[KERNEL] no /init program, staying in kernel");
    }

    log!("[KERNEL] boot complete");
    loop {
        arch::asm::sti_hlt();
    }
}

/// Bring the subsystems up in dependency order. Interrupts stay masked
/// until every boot-time handler is registered; the IDE driver needs them
/// live for its completion handshake.
fn init_all() {
    interrupts::init();
    timer::init();
    memory::init();
    thread::init();
    console::init();
    keyboard::init();
    arch::gdt::init();
    syscall::init();
    interrupts::enable();
    ide::init();
    fs::init();
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable();
    serial_println!();
    serial_println!("!!! KERNEL PANIC !!!");
    serial_println!("{}", info);
    loop {
        arch::asm::hlt();
    }
}
