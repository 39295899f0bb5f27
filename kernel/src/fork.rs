//! `fork`: duplicate the calling user process.
//!
//! The child reuses the parent's entire kernel page byte-for-byte (TCB plus
//! kernel stack, including the syscall frame the parent trapped in with),
//! then gets its own pid, virtual-region bitmap, page directory and a copy
//! of every mapped user page, moved through a kernel bounce buffer while
//! cr3 flips between the two address spaces. A hand-laid return frame makes
//! the child surface from its first schedule inside `intr_exit` with
//! `eax = 0`; the parent receives the child's pid.

use core::mem::size_of;
use core::ptr;

use crate::arch::trap::{intr_exit, IntrFrame};
use crate::fs::file;
use crate::interrupts;
use crate::memory::{self, PAGE_SIZE, USER_VADDR_START};
use crate::process;
use crate::thread::{self, Pid, Task, TaskStatus, MAX_FILES_OPEN_PER_PROC, TASK_NAME_LEN};

/// Copy the parent's kernel page and re-seed the child-private TCB fields.
fn copy_pcb_vaddrbitmap_stack0(child: *mut Task, parent: *mut Task) -> Result<(), ()> {
    unsafe {
        ptr::copy_nonoverlapping(parent as *const u8, child as *mut u8, PAGE_SIZE);
        (*child).pid = thread::fork_pid();
        (*child).elapsed_ticks = 0;
        (*child).status = TaskStatus::Ready;
        (*child).ticks = (*child).priority;
        (*child).parent_pid = (*parent).pid;
        (*child).general_tag = crate::list::ListElem::new();
        (*child).all_list_tag = crate::list::ListElem::new();
        memory::block_desc_init(&mut (*child).u_block_descs);

        // A private copy of the parent's user-space bitmap.
        let bits = (memory::KERNEL_OFFSET - USER_VADDR_START) as usize / PAGE_SIZE / 8;
        let bitmap_pg_cnt = memory::div_round_up(bits, PAGE_SIZE);
        let Some(store) = memory::get_kernel_pages(bitmap_pg_cnt) else {
            return Err(());
        };
        ptr::copy_nonoverlapping(
            (*parent).userprog_vaddr.bitmap.bits_ptr(),
            store as *mut u8,
            bits,
        );
        (*child).userprog_vaddr.bitmap.reset(store as *mut u8, bits);

        // Tag the name so `ps` output tells the two apart.
        let name_len = (*child).name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_LEN);
        let suffix = b"_fork";
        if name_len + suffix.len() < TASK_NAME_LEN {
            (&mut (*child).name)[name_len..name_len + suffix.len()].copy_from_slice(suffix);
        }
    }
    Ok(())
}

/// Copy every mapped user page of `parent` into `child`'s address space
/// through `bounce`, one page at a time.
///
/// Runs with the user pool held and interrupts quiesced: nothing may
/// reschedule (and reload cr3) between the page-directory flips.
fn copy_body_stack3(child: *mut Task, parent: *mut Task, bounce: *mut u8) {
    unsafe {
        let bitmap = &(*parent).userprog_vaddr.bitmap;
        let vaddr_start = (*parent).userprog_vaddr.vaddr_start;

        for idx in 0..bitmap.bit_len() {
            if !bitmap.test(idx) {
                continue;
            }
            let vaddr = vaddr_start + (idx * PAGE_SIZE) as u32;

            // Parent's tables are live: stage the page in kernel memory.
            ptr::copy_nonoverlapping(vaddr as *const u8, bounce, PAGE_SIZE);

            // Map the same virtual page in the child (its cloned bitmap
            // already accounts for it) and fill it from the bounce buffer.
            process::activate_page_dir(child);
            memory::get_a_page_nolock(vaddr).expect("out of user pages in fork");
            ptr::copy_nonoverlapping(bounce, vaddr as *mut u8, PAGE_SIZE);

            process::activate_page_dir(parent);
        }
    }
}

/// Lay the child's first-schedule frame: `switch_to` pops four zeroed
/// callee-saved registers and "returns" into `intr_exit`, which restores
/// the copied syscall frame with `eax` forced to 0.
fn build_child_stack(child: *mut Task) {
    unsafe {
        let intr_frame =
            (child as u32 + PAGE_SIZE as u32 - size_of::<IntrFrame>() as u32) as *mut IntrFrame;
        (*intr_frame).eax = 0;

        // Five words right below the frame: ebp, ebx, edi, esi, eip.
        let ret_addr = (intr_frame as *mut u32).sub(1);
        *ret_addr = intr_exit as u32;
        let regs = (intr_frame as *mut u32).sub(5);
        for slot in 0..4 {
            *regs.add(slot) = 0;
        }
        (*child).self_kstack = regs as u32;
    }
}

/// Every descriptor the child inherited keeps its backing inode alive.
fn update_inode_open_cnts(task: *mut Task) {
    unsafe {
        for local_fd in 3..MAX_FILES_OPEN_PER_PROC {
            let global = (*task).fd_table[local_fd];
            if global != -1 {
                let inode = file::file_table()[global as usize].fd_inode;
                assert!(!inode.is_null());
                (*inode).open_cnt += 1;
            }
        }
    }
}

fn copy_process(child: *mut Task, parent: *mut Task) -> Result<(), ()> {
    let Some(bounce) = memory::get_kernel_pages(1) else {
        return Err(());
    };

    copy_pcb_vaddrbitmap_stack0(child, parent)?;
    unsafe {
        (*child).pgdir = match process::page_dir_create() {
            Some(pgdir) => pgdir,
            None => return Err(()),
        };
    }

    memory::user_pool_guard_acquire();
    let old = interrupts::disable();
    copy_body_stack3(child, parent, bounce as *mut u8);
    interrupts::set_status(old);
    memory::user_pool_guard_release();

    build_child_stack(child);
    update_inode_open_cnts(child);

    memory::mfree_page(memory::PoolFlag::Kernel, bounce, 1);
    Ok(())
}

/// Clone the calling process. Parent gets the child pid, the child gets 0.
pub fn sys_fork() -> Result<Pid, ()> {
    let parent = thread::running_task();
    // Kernel threads share one address space; only processes may fork.
    assert!(unsafe { (*parent).pgdir } != 0, "fork from kernel thread");

    let Some(child_page) = memory::get_kernel_pages(1) else {
        return Err(());
    };
    let child = child_page as *mut Task;

    copy_process(child, parent)?;

    thread::enqueue(child);
    let child_pid = unsafe { (*child).pid };
    crate::log_debug!(
        "[FORK] pid {} forked child {}",
        unsafe { (*parent).pid },
        child_pid
    );
    Ok(child_pid)
}
