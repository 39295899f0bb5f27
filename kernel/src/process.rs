//! User processes: address-space bring-up and program images.
//!
//! A process is a task with its own page directory whose kernel half
//! aliases the shared kernel page tables, a virtual-region bitmap covering
//! user space, and per-task heap descriptors. The first entry into ring 3
//! is staged as a hand-built interrupt frame at the top of the kernel-stack
//! page; `intr_exit` "returns" through it into the program.
//!
//! Program images are flat binaries read from the file system and placed at
//! the fixed user image base (an ELF loader sits outside this kernel's
//! scope).

use alloc::boxed::Box;
use alloc::string::String;
use core::mem::size_of;
use core::ptr;

use crate::arch::asm;
use crate::arch::gdt::{
    self, EFLAGS_IF, EFLAGS_IOPL_0, EFLAGS_MBS, SELECTOR_U_CODE, SELECTOR_U_DATA,
};
use crate::arch::trap::IntrFrame;
use crate::fs::{self, FsError, FsResult, OpenFlags};
use crate::interrupts;
use crate::memory::{
    self, paging, PoolFlag, KERNEL_OFFSET, KERNEL_PAGE_DIR_PHYS, PAGE_SIZE, USER_VADDR_START,
};
use crate::thread::{self, Task};

/// Top page of user space, right below the kernel split.
pub const USER_STACK3_VADDR: u32 = KERNEL_OFFSET - PAGE_SIZE as u32;

const DEFAULT_PRIO: u8 = 31;

/// Switch to `task`'s address space and, for processes, point the TSS at
/// its kernel stack so the next ring-3 → ring-0 transition lands there.
/// Kernel threads share the boot page directory.
pub fn activate(task: *mut Task) {
    let pgdir = unsafe { (*task).pgdir };
    let pgdir_phys = if pgdir != 0 {
        memory::addr_v2p(pgdir)
    } else {
        KERNEL_PAGE_DIR_PHYS
    };
    unsafe {
        asm::write_cr3(pgdir_phys);
    }
    if pgdir != 0 {
        gdt::update_esp0(task as u32 + PAGE_SIZE as u32);
    }
}

/// Load only cr3; `fork` flips between parent and child spaces with this.
pub fn activate_page_dir(task: *mut Task) {
    let pgdir = unsafe { (*task).pgdir };
    let pgdir_phys = if pgdir != 0 {
        memory::addr_v2p(pgdir)
    } else {
        KERNEL_PAGE_DIR_PHYS
    };
    unsafe {
        asm::write_cr3(pgdir_phys);
    }
}

/// Build a page directory for a new process: kernel-half PDEs copied from
/// the live directory, last PDE self-referencing.
pub fn page_dir_create() -> Option<u32> {
    let page_dir_vaddr = memory::get_kernel_pages(1)?;
    unsafe {
        // Entries 768..1023 alias the shared kernel page tables.
        ptr::copy_nonoverlapping(
            (0xffff_f000u32 + 768 * 4) as *const u8,
            (page_dir_vaddr + 768 * 4) as *mut u8,
            256 * 4,
        );
        let page_dir_phys = memory::addr_v2p(page_dir_vaddr);
        *((page_dir_vaddr + 1023 * 4) as *mut u32) = page_dir_phys
            | (paging::EntryFlags::PRESENT | paging::EntryFlags::WRITABLE | paging::EntryFlags::USER)
                .bits();
    }
    Some(page_dir_vaddr)
}

/// Give `task` a bitmap covering user space from the image base up to the
/// kernel split.
pub fn create_user_vaddr_bitmap(task: *mut Task) {
    let bits = (KERNEL_OFFSET - USER_VADDR_START) as usize / PAGE_SIZE / 8;
    let bitmap_pg_cnt = memory::div_round_up(bits, PAGE_SIZE);
    let store = memory::get_kernel_pages(bitmap_pg_cnt).expect("out of pages for vaddr bitmap");
    unsafe {
        (*task).userprog_vaddr.vaddr_start = USER_VADDR_START;
        (*task).userprog_vaddr.bitmap.reset(store as *mut u8, bits);
        (*task).userprog_vaddr.bitmap.init();
    }
}

/// Is `vaddr` mapped in the live page table?
fn page_mapped(vaddr: u32) -> bool {
    unsafe {
        let pde = *paging::pde_ptr(vaddr);
        if pde & paging::EntryFlags::PRESENT.bits() == 0 {
            return false;
        }
        *paging::pte_ptr(vaddr) & paging::EntryFlags::PRESENT.bits() != 0
    }
}

/// Read the flat image at `path` into user pages at the image base.
/// Returns the entry address. Pages already mapped (a previous image) are
/// reused in place.
fn load_image(path: &str) -> FsResult<u32> {
    let stat = fs::sys_stat(path)?;
    if stat.size == 0 {
        return Err(FsError::InvalidArgument);
    }
    let fd = fs::sys_open(path, OpenFlags::RDONLY)?;

    let pages = memory::div_round_up(stat.size as usize, PAGE_SIZE);
    for page in 0..pages {
        let vaddr = USER_VADDR_START + (page * PAGE_SIZE) as u32;
        if !page_mapped(vaddr) {
            if memory::get_a_page(PoolFlag::User, vaddr).is_none() {
                fs::sys_close(fd)?;
                return Err(FsError::NoFreeBlock);
            }
        }
    }

    let image =
        unsafe { core::slice::from_raw_parts_mut(USER_VADDR_START as *mut u8, stat.size as usize) };
    let mut loaded = 0;
    while loaded < image.len() {
        let n = fs::sys_read(fd, &mut image[loaded..])?;
        if n == 0 {
            break;
        }
        loaded += n;
    }
    fs::sys_close(fd)?;
    if loaded != image.len() {
        return Err(FsError::InvalidArgument);
    }
    Ok(USER_VADDR_START)
}

/// Thread body of a nascent process: runs with the process's own page
/// directory already active, loads the image, stages the ring-3 frame and
/// drops through `intr_exit`.
fn start_process(path_box: usize) {
    let path = unsafe { Box::from_raw(path_box as *mut String) };
    let entry = match load_image(&path) {
        Ok(entry) => entry,
        Err(err) => panic!("load of '{}' failed: {}", &*path, err),
    };
    drop(path);

    let cur = thread::running_task();
    // The user stack page sits just below the kernel split.
    memory::get_a_page(PoolFlag::User, USER_STACK3_VADDR).expect("no page for user stack");

    let frame = (cur as u32 + PAGE_SIZE as u32 - size_of::<IntrFrame>() as u32) as *mut IntrFrame;
    unsafe {
        (*frame).edi = 0;
        (*frame).esi = 0;
        (*frame).ebp = 0;
        (*frame).esp_dummy = 0;
        (*frame).ebx = 0;
        (*frame).edx = 0;
        (*frame).ecx = 0;
        (*frame).eax = 0;
        (*frame).gs = 0;
        (*frame).fs = SELECTOR_U_DATA as u32;
        (*frame).es = SELECTOR_U_DATA as u32;
        (*frame).ds = SELECTOR_U_DATA as u32;
        (*frame).vec_no = 0;
        (*frame).err_code = 0;
        (*frame).eip = entry;
        (*frame).cs = SELECTOR_U_CODE as u32;
        (*frame).eflags = EFLAGS_IOPL_0 | EFLAGS_MBS | EFLAGS_IF;
        (*frame).user_esp = USER_STACK3_VADDR + PAGE_SIZE as u32;
        (*frame).user_ss = SELECTOR_U_DATA as u32;
    }
    enter_user(frame);
}

#[cfg(target_arch = "x86")]
fn enter_user(frame: *mut IntrFrame) -> ! {
    unsafe {
        core::arch::asm!(
            "mov esp, {0}",
            "jmp {1}",
            in(reg) frame,
            sym crate::arch::trap::intr_exit,
            options(noreturn),
        );
    }
}

#[cfg(not(target_arch = "x86"))]
fn enter_user(_frame: *mut IntrFrame) -> ! {
    unreachable!()
}

/// Create a user process that will execute the program at `path`.
pub fn execute(path: &str, name: &str) -> *mut Task {
    let task = memory::get_kernel_pages(1).expect("out of kernel pages for PCB") as *mut Task;
    thread::init_task(task, name, DEFAULT_PRIO);
    create_user_vaddr_bitmap(task);
    let path_box = Box::into_raw(Box::new(String::from(path))) as usize;
    thread::create(task, start_process, path_box);
    unsafe {
        memory::block_desc_init(&mut (*task).u_block_descs);
        (*task).pgdir = page_dir_create().expect("out of kernel pages for page directory");
    }

    interrupts::without_interrupts(|| {
        thread::enqueue(task);
    });
    task
}

/// Replace the calling process's image with the program at `path`. On
/// success the rewritten frame makes `intr_exit` resume inside the new
/// program; the syscall return value becomes its initial `eax`.
pub fn sys_execv(path: &str, frame: &mut IntrFrame) -> FsResult<i32> {
    let cur = thread::running_task();
    if unsafe { (*cur).pgdir } == 0 {
        // Kernel threads have no user image to replace.
        return Err(FsError::InvalidArgument);
    }

    let entry = load_image(path)?;

    // Rename the task after the program.
    let name = path.rsplit('/').next().unwrap_or(path);
    unsafe {
        (*cur).name = [0; thread::TASK_NAME_LEN];
        let len = name.len().min(thread::TASK_NAME_LEN - 1);
        (&mut (*cur).name)[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    frame.eip = entry;
    frame.user_esp = USER_STACK3_VADDR + PAGE_SIZE as u32;
    frame.ebx = 0;
    frame.ecx = 0;
    frame.edx = 0;
    Ok(0)
}
