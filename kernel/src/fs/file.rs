//! The open-file table and file-level read/write.
//!
//! One process-wide table of [`MAX_FILE_OPEN`] entries, indexed from 3 (the
//! std streams never occupy slots). Per-task descriptors map into this
//! table. Each entry carries its own byte position, so one inode opened
//! twice seeks independently.

use alloc::boxed::Box;
use alloc::vec;
use core::cell::UnsafeCell;
use core::ptr;

use crate::fs::dir::{self, Dir, DirEntry, FileType};
use crate::fs::inode::{self, Inode, DIRECT_SLOTS, MAX_FILE_BLOCKS};
use crate::fs::superblock::{BLOCK_SIZE, SECTOR_SIZE};
use crate::fs::{FsError, FsResult, OpenFlags};
use crate::ide::{self, Partition};
use crate::interrupts;
use crate::thread::{self, MAX_FILES_OPEN_PER_PROC};

/// System-wide cap on simultaneously open files.
pub const MAX_FILE_OPEN: usize = 32;

/// Largest file the 12+128 block map can address.
pub const MAX_FILE_BYTES: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

/// One open-file table entry.
#[derive(Clone, Copy)]
pub struct File {
    /// Current byte position.
    pub fd_pos: u32,
    pub fd_flag: u32,
    pub fd_inode: *mut Inode,
}

impl File {
    const fn free() -> Self {
        Self { fd_pos: 0, fd_flag: 0, fd_inode: ptr::null_mut() }
    }
}

struct TableCell(UnsafeCell<[File; MAX_FILE_OPEN]>);
unsafe impl Sync for TableCell {}

/// The process-wide open-file table. Slots 0–2 are reserved so descriptor
/// numbers and table indices never collide with the std streams.
static FILE_TABLE: TableCell = TableCell(UnsafeCell::new([File::free(); MAX_FILE_OPEN]));

pub fn file_table() -> &'static mut [File; MAX_FILE_OPEN] {
    unsafe { &mut *FILE_TABLE.0.get() }
}

/// First free table slot at or above 3.
pub fn get_free_slot() -> FsResult<usize> {
    let table = file_table();
    for (idx, entry) in table.iter().enumerate().skip(3) {
        if entry.fd_inode.is_null() {
            return Ok(idx);
        }
    }
    crate::log_warn!("[FS] exceed max open files");
    Err(FsError::NoFreeFileSlot)
}

/// Map a table index into the running task's descriptor array.
pub fn pcb_fd_install(global_idx: usize) -> FsResult<usize> {
    let cur = thread::running_task();
    unsafe {
        for local_fd in 3..MAX_FILES_OPEN_PER_PROC {
            if (*cur).fd_table[local_fd] == -1 {
                (*cur).fd_table[local_fd] = global_idx as i32;
                return Ok(local_fd);
            }
        }
    }
    crate::log_warn!("[FS] exceed max open files per task");
    Err(FsError::NoFreeFd)
}

/// Claim a free inode number in the inode bitmap.
pub fn inode_bitmap_alloc(part: *mut Partition) -> Option<u32> {
    unsafe { (*part).inode_bitmap.scan_and_set(1).map(|bit| bit as u32) }
}

/// Claim a free data block; returns its absolute LBA.
pub fn block_bitmap_alloc(part: *mut Partition) -> Option<u32> {
    unsafe {
        let bit = (*part).block_bitmap.scan_and_set(1)?;
        Some((*(*part).sb).data_start_lba + bit as u32)
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum BitmapType {
    Inode,
    Block,
}

/// Persist the 512-byte bitmap sector containing `bit_idx`.
pub fn bitmap_sync(part: *mut Partition, bit_idx: usize, which: BitmapType) {
    let off_sec = bit_idx / 4096;
    let off_bytes = off_sec * BLOCK_SIZE;
    unsafe {
        let sb = &*(*part).sb;
        let (sec_lba, bitmap_off) = match which {
            BitmapType::Inode => (
                sb.inode_bitmap_lba + off_sec as u32,
                (*part).inode_bitmap.bits_ptr().add(off_bytes),
            ),
            BitmapType::Block => (
                sb.block_bitmap_lba + off_sec as u32,
                (*part).block_bitmap.bits_ptr().add(off_bytes),
            ),
        };
        ide::write((*part).disk, sec_lba, bitmap_off, 1);
    }
}

/// Create a file named `name` under `parent`, open it and install a task
/// descriptor. Each failure step rolls back what earlier steps claimed, in
/// reverse order.
pub fn file_create(
    part: *mut Partition,
    parent: *mut Dir,
    name: &str,
    flag: OpenFlags,
) -> FsResult<usize> {
    let mut io_buf = vec![0u8; 2 * SECTOR_SIZE];

    let Some(inode_no) = inode_bitmap_alloc(part) else {
        crate::log_warn!("[FS] file_create: no free inode");
        return Err(FsError::NoFreeInode);
    };

    // The cache entry must outlive this call; it comes off the kernel heap.
    let new_inode = Box::into_raw(Box::new(Inode::new(inode_no)));

    let fd_idx = match get_free_slot() {
        Ok(idx) => idx,
        Err(err) => {
            rollback_create(part, inode_no, Some(new_inode), None);
            return Err(err);
        }
    };

    let table = file_table();
    table[fd_idx].fd_inode = new_inode;
    table[fd_idx].fd_pos = 0;
    table[fd_idx].fd_flag = flag.bits() as u32;
    unsafe {
        (*new_inode).write_deny = false;
    }

    let entry = DirEntry::new(name, inode_no, FileType::Regular);
    if let Err(err) = dir::sync_dir_entry(part, parent, &entry, &mut io_buf) {
        crate::log_warn!("[FS] file_create: sync dir entry failed");
        rollback_create(part, inode_no, Some(new_inode), Some(fd_idx));
        return Err(err);
    }

    unsafe {
        // Persist the parent (its size grew), the new inode and the bitmap.
        io_buf.fill(0);
        inode::sync(part, (*parent).inode, &mut io_buf);
        io_buf.fill(0);
        inode::sync(part, new_inode, &mut io_buf);
        bitmap_sync(part, inode_no as usize, BitmapType::Inode);

        (*part).open_inodes.push_front(&mut (*new_inode).tag);
        (*new_inode).open_cnt = 1;
    }

    pcb_fd_install(fd_idx)
}

/// Undo the steps of `file_create` that had completed before a failure.
fn rollback_create(
    part: *mut Partition,
    inode_no: u32,
    new_inode: Option<*mut Inode>,
    fd_idx: Option<usize>,
) {
    if let Some(fd_idx) = fd_idx {
        file_table()[fd_idx] = File::free();
    }
    if let Some(inode) = new_inode {
        unsafe { drop(Box::from_raw(inode)) };
    }
    unsafe {
        (*part).inode_bitmap.set(inode_no as usize, false);
    }
}

/// Open inode `inode_no` into a fresh table slot. A writer is refused while
/// another writer has the inode.
pub fn file_open(part: *mut Partition, inode_no: u32, flag: OpenFlags) -> FsResult<usize> {
    let fd_idx = get_free_slot()?;
    let table = file_table();
    let node = inode::open(part, inode_no);
    table[fd_idx].fd_inode = node;
    table[fd_idx].fd_pos = 0;
    table[fd_idx].fd_flag = flag.bits() as u32;

    if flag.intersects(OpenFlags::WRONLY | OpenFlags::RDWR) {
        // Writer exclusion is checked with interrupts off; two tasks
        // racing here would otherwise both see the flag clear.
        let old = interrupts::disable();
        let denied = unsafe { (*node).write_deny };
        if denied {
            interrupts::set_status(old);
            table[fd_idx] = File::free();
            inode::close(node);
            crate::log_warn!("[FS] file is being written, try again later");
            return Err(FsError::WriteDeny);
        }
        unsafe { (*node).write_deny = true };
        interrupts::set_status(old);
    }

    pcb_fd_install(fd_idx)
}

/// Release a table entry; the last close evicts the inode.
pub fn file_close(file: &mut File) {
    if file.fd_inode.is_null() {
        return;
    }
    unsafe {
        (*file.fd_inode).write_deny = false;
    }
    inode::close(file.fd_inode);
    file.fd_inode = ptr::null_mut();
}

/// Write `buf` at the file's current position, allocating data blocks (and
/// the indirect table) on demand. Returns the bytes written and advances
/// the position; the inode is persisted on success.
pub fn file_write(part: *mut Partition, file: &mut File, buf: &[u8]) -> FsResult<usize> {
    let node = file.fd_inode;
    let pos = file.fd_pos as usize;
    let count = buf.len();
    let old_size = unsafe { (*node).i_size as usize };
    // lseek clamps to [0, size], so the write region never leaves a hole.
    assert!(pos <= old_size);

    if pos + count > MAX_FILE_BYTES {
        crate::log_warn!("[FS] file_write: exceeds the {} byte file cap", MAX_FILE_BYTES);
        return Err(FsError::NoFreeBlock);
    }
    if count == 0 {
        return Ok(0);
    }

    let sb = unsafe { &*(*part).sb };
    let data_start_lba = sb.data_start_lba;

    // First write to an empty file claims block 0.
    unsafe {
        if (*node).sectors[0] == 0 {
            let Some(lba) = block_bitmap_alloc(part) else {
                return Err(FsError::NoFreeBlock);
            };
            (*node).sectors[0] = lba;
            bitmap_sync(part, (lba - data_start_lba) as usize, BitmapType::Block);
        }
    }

    let blocks_at_entry = crate::memory::div_round_up(old_size.max(1), BLOCK_SIZE);
    let end = old_size.max(pos + count);
    let blocks_needed = crate::memory::div_round_up(end, BLOCK_SIZE);
    assert!(blocks_needed <= MAX_FILE_BLOCKS);

    let mut all_blocks = Box::new([0u32; MAX_FILE_BLOCKS]);
    inode::collect_all_blocks(part, node, &mut all_blocks);

    // Grow the block map up front so the copy loop below never allocates.
    if blocks_needed > blocks_at_entry {
        unsafe {
            if blocks_needed > DIRECT_SLOTS && (*node).sectors[DIRECT_SLOTS] == 0 {
                let Some(table_lba) = block_bitmap_alloc(part) else {
                    return Err(FsError::NoFreeBlock);
                };
                (*node).sectors[DIRECT_SLOTS] = table_lba;
                bitmap_sync(part, (table_lba - data_start_lba) as usize, BitmapType::Block);
            }
            for block_idx in blocks_at_entry..blocks_needed {
                let Some(lba) = block_bitmap_alloc(part) else {
                    return Err(FsError::NoFreeBlock);
                };
                assert_eq!(all_blocks[block_idx], 0);
                all_blocks[block_idx] = lba;
                if block_idx < DIRECT_SLOTS {
                    (*node).sectors[block_idx] = lba;
                }
                bitmap_sync(part, (lba - data_start_lba) as usize, BitmapType::Block);
            }
            if blocks_needed > DIRECT_SLOTS {
                ide::write(
                    (*part).disk,
                    (*node).sectors[DIRECT_SLOTS],
                    all_blocks[DIRECT_SLOTS..].as_ptr() as *const u8,
                    1,
                );
            }
        }
    }

    // Copy through a one-sector bounce buffer, read-modify-write where the
    // sector already holds file data.
    let mut io_buf = vec![0u8; SECTOR_SIZE];
    let mut bytes_written = 0usize;
    let mut cursor = pos;
    while bytes_written < count {
        io_buf.fill(0);
        let sec_idx = cursor / BLOCK_SIZE;
        let sec_lba = all_blocks[sec_idx];
        let sec_off = cursor % BLOCK_SIZE;
        let chunk = (count - bytes_written).min(BLOCK_SIZE - sec_off);

        let pre_existing = sec_idx < blocks_at_entry && old_size > 0;
        if pre_existing && (sec_off != 0 || chunk < BLOCK_SIZE) {
            unsafe { ide::read((*part).disk, sec_lba, io_buf.as_mut_ptr(), 1) };
        }
        io_buf[sec_off..sec_off + chunk].copy_from_slice(&buf[bytes_written..bytes_written + chunk]);
        unsafe { ide::write((*part).disk, sec_lba, io_buf.as_ptr(), 1) };

        cursor += chunk;
        bytes_written += chunk;
    }

    unsafe {
        (*node).i_size = end as u32;
    }
    file.fd_pos = cursor as u32;

    let mut sync_buf = vec![0u8; 2 * SECTOR_SIZE];
    inode::sync(part, node, &mut sync_buf);
    Ok(bytes_written)
}

/// Read up to `buf.len()` bytes from the current position; stops at EOF.
pub fn file_read(part: *mut Partition, file: &mut File, buf: &mut [u8]) -> FsResult<usize> {
    let node = file.fd_inode;
    let size = unsafe { (*node).i_size as usize };
    let pos = file.fd_pos as usize;
    if pos >= size {
        return Ok(0);
    }
    let count = buf.len().min(size - pos);

    let mut all_blocks = Box::new([0u32; MAX_FILE_BLOCKS]);
    inode::collect_all_blocks(part, node, &mut all_blocks);

    let mut io_buf = vec![0u8; SECTOR_SIZE];
    let mut bytes_read = 0usize;
    let mut cursor = pos;
    while bytes_read < count {
        let sec_idx = cursor / BLOCK_SIZE;
        let sec_lba = all_blocks[sec_idx];
        let sec_off = cursor % BLOCK_SIZE;
        let chunk = (count - bytes_read).min(BLOCK_SIZE - sec_off);

        unsafe { ide::read((*part).disk, sec_lba, io_buf.as_mut_ptr(), 1) };
        buf[bytes_read..bytes_read + chunk].copy_from_slice(&io_buf[sec_off..sec_off + chunk]);

        cursor += chunk;
        bytes_read += chunk;
    }
    file.fd_pos = cursor as u32;
    Ok(bytes_read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn file_cap_is_140_blocks() {
        assert_eq!(MAX_FILE_BYTES, 71680);
    }

    #[test]
    fn table_slots_start_free() {
        let f = File::free();
        assert!(f.fd_inode.is_null());
        assert_eq!(f.fd_pos, 0);
    }

    #[test]
    fn entry_size_is_stable() {
        // The table is copied wholesale by fork; keep its entry POD-sized.
        assert_eq!(size_of::<File>(), 8 + size_of::<*mut Inode>());
    }
}
