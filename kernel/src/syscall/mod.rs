//! System call interface.
//!
//! Vector 0x80 is the sole user→kernel boundary: call number in `eax`,
//! up to three arguments in `ebx`/`ecx`/`edx`, result back through the
//! saved frame's `eax`, which `intr_exit` restores into the resuming user
//! context. The handler indexes a 32-slot dispatch table; unused slots
//! answer -1.
//!
//! Failures fold into -1 (there is no errno surface); the fs layer logs
//! the specific cause before it reaches this boundary.

use crate::arch::trap::IntrFrame;
use crate::fs::{self, FsError, OpenFlags, Whence};
use crate::interrupts::{self, SYSCALL_VECTOR};
use crate::memory;
use crate::thread;

/// Call numbers.
pub mod nr {
    pub const GETPID: u32 = 0;
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;
    pub const MALLOC: u32 = 3;
    pub const FREE: u32 = 4;
    pub const OPEN: u32 = 5;
    pub const CLOSE: u32 = 6;
    pub const LSEEK: u32 = 7;
    pub const UNLINK: u32 = 8;
    pub const MKDIR: u32 = 9;
    pub const RMDIR: u32 = 10;
    pub const OPENDIR: u32 = 11;
    pub const CLOSEDIR: u32 = 12;
    pub const READDIR: u32 = 13;
    pub const REWINDDIR: u32 = 14;
    pub const CHDIR: u32 = 15;
    pub const GETCWD: u32 = 16;
    pub const STAT: u32 = 17;
    pub const FORK: u32 = 18;
    pub const EXECV: u32 = 19;
    pub const PS: u32 = 20;
    pub const CLEAR: u32 = 21;
}

/// Size of the dispatch table.
pub const SYSCALL_CNT: u32 = 32;

/// `stat` result as user space sees it.
#[repr(C)]
pub struct UserStat {
    pub ino: u32,
    pub size: u32,
    pub f_type: u32,
}

/// Borrow a user buffer. Flat segments: a user pointer is directly
/// dereferenceable once we are in the caller's address space.
unsafe fn user_slice(ptr: u32, len: u32) -> Option<&'static [u8]> {
    if ptr == 0 {
        return None;
    }
    Some(core::slice::from_raw_parts(ptr as *const u8, len as usize))
}

unsafe fn user_slice_mut(ptr: u32, len: u32) -> Option<&'static mut [u8]> {
    if ptr == 0 {
        return None;
    }
    Some(core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize))
}

/// Borrow a NUL-terminated user path.
unsafe fn user_cstr(ptr: u32) -> Option<&'static str> {
    if ptr == 0 {
        return None;
    }
    let base = ptr as *const u8;
    for len in 0..fs::MAX_PATH_LEN {
        if *base.add(len) == 0 {
            let bytes = core::slice::from_raw_parts(base, len);
            return core::str::from_utf8(bytes).ok();
        }
    }
    None
}

fn fs_ret(result: Result<usize, FsError>) -> i32 {
    match result {
        Ok(n) => n as i32,
        Err(_) => -1,
    }
}

fn fs_unit_ret(result: Result<(), FsError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// The 0x80 handler: decode, dispatch, store the result in the saved
/// frame's `eax`.
fn syscall_handler(_vec: u8, frame: &mut IntrFrame) {
    let nr = frame.eax;
    let (a1, a2, a3) = (frame.ebx, frame.ecx, frame.edx);

    let ret: i32 = match nr {
        nr::GETPID => thread::current_pid() as i32,

        nr::WRITE => match unsafe { user_slice(a2, a3) } {
            Some(buf) => fs_ret(fs::sys_write(a1 as usize, buf)),
            None => -1,
        },

        nr::READ => match unsafe { user_slice_mut(a2, a3) } {
            Some(buf) => fs_ret(fs::sys_read(a1 as usize, buf)),
            None => -1,
        },

        nr::MALLOC => memory::sys_malloc(a1 as usize).map_or(0, |p| p as i32),

        nr::FREE => {
            memory::sys_free(a1 as *mut u8);
            0
        }

        nr::OPEN => match unsafe { user_cstr(a1) } {
            Some(path) => fs_ret(fs::sys_open(path, OpenFlags::from_bits_truncate(a2 as u8))),
            None => -1,
        },

        nr::CLOSE => fs_unit_ret(fs::sys_close(a1 as usize)),

        nr::LSEEK => match Whence::from_raw(a3) {
            Some(whence) => match fs::sys_lseek(a1 as usize, a2 as i32, whence) {
                Ok(pos) => pos as i32,
                Err(_) => -1,
            },
            None => -1,
        },

        nr::UNLINK => match unsafe { user_cstr(a1) } {
            Some(path) => fs_unit_ret(fs::sys_unlink(path)),
            None => -1,
        },

        nr::MKDIR => match unsafe { user_cstr(a1) } {
            Some(path) => fs_unit_ret(fs::sys_mkdir(path)),
            None => -1,
        },

        nr::RMDIR => match unsafe { user_cstr(a1) } {
            Some(path) => fs_unit_ret(fs::sys_rmdir(path)),
            None => -1,
        },

        nr::OPENDIR => match unsafe { user_cstr(a1) } {
            Some(path) => fs_ret(fs::sys_opendir(path)),
            None => -1,
        },

        nr::CLOSEDIR => fs_unit_ret(fs::sys_closedir(a1 as usize)),

        // readdir(handle, out): copy the next entry into the caller's
        // buffer. 1 = entry produced, 0 = end of directory.
        nr::READDIR => {
            let out = a2 as *mut fs::dir::DirEntry;
            if out.is_null() {
                -1
            } else {
                match fs::sys_readdir(a1 as usize) {
                    Ok(Some(entry)) => {
                        unsafe { *out = entry };
                        1
                    }
                    Ok(None) => 0,
                    Err(_) => -1,
                }
            }
        }

        nr::REWINDDIR => fs_unit_ret(fs::sys_rewinddir(a1 as usize)),

        nr::CHDIR => match unsafe { user_cstr(a1) } {
            Some(path) => fs_unit_ret(fs::sys_chdir(path)),
            None => -1,
        },

        nr::GETCWD => match unsafe { user_slice_mut(a1, a2) } {
            Some(buf) => match fs::sys_getcwd() {
                Ok(cwd) if cwd.len() < buf.len() => {
                    buf[..cwd.len()].copy_from_slice(cwd.as_bytes());
                    buf[cwd.len()] = 0;
                    a1 as i32
                }
                _ => 0,
            },
            None => 0,
        },

        nr::STAT => match (unsafe { user_cstr(a1) }, a2) {
            (Some(path), stat_ptr) if stat_ptr != 0 => match fs::sys_stat(path) {
                Ok(stat) => {
                    let out = stat_ptr as *mut UserStat;
                    unsafe {
                        (*out).ino = stat.ino;
                        (*out).size = stat.size;
                        (*out).f_type = stat.f_type as u32;
                    }
                    0
                }
                Err(_) => -1,
            },
            _ => -1,
        },

        nr::FORK => match crate::fork::sys_fork() {
            Ok(pid) => pid as i32,
            Err(()) => -1,
        },

        nr::EXECV => match unsafe { user_cstr(a1) } {
            Some(path) => match crate::process::sys_execv(path, frame) {
                Ok(ret) => ret,
                Err(_) => -1,
            },
            None => -1,
        },

        nr::PS => {
            thread::ps();
            0
        }

        nr::CLEAR => {
            crate::console::clear();
            0
        }

        _ => {
            crate::log_warn!("[SYSCALL] unknown call {:#x}", nr);
            -1
        }
    };

    frame.eax = ret as u32;
}

/// Claim vector 0x80. The gate itself was built DPL 3 by the IDT.
pub fn init() {
    interrupts::register_handler(SYSCALL_VECTOR, syscall_handler);
    crate::log!("[SYSCALL] dispatch table armed ({} slots)", SYSCALL_CNT);
}
