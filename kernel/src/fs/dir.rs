//! Directories and directory entries.
//!
//! A directory is a file whose content is a dense array of fixed-size
//! entries `{name, inode, type}`; entries never straddle a sector. The
//! in-memory handle carries the open inode, a byte cursor for `readdir`
//! and a one-sector read-ahead buffer.

use alloc::boxed::Box;
use alloc::vec;
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr;

use crate::fs::file::{self, BitmapType};
use crate::fs::inode::{self, Inode, DIRECT_SLOTS, MAX_FILE_BLOCKS};
use crate::fs::superblock::SECTOR_SIZE;
use crate::fs::{FsError, FsResult};
use crate::ide::{self, Partition};

pub const MAX_FILE_NAME_LEN: usize = 16;

/// File type tag stored in each directory entry.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// An unused entry slot.
    Unknown = 0,
    Regular = 1,
    Directory = 2,
}

/// On-disk directory entry: 24 packed bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DirEntry {
    pub filename: [u8; MAX_FILE_NAME_LEN],
    pub i_no: u32,
    pub f_type: FileType,
}

impl DirEntry {
    pub fn empty() -> Self {
        Self {
            filename: [0; MAX_FILE_NAME_LEN],
            i_no: 0,
            f_type: FileType::Unknown,
        }
    }

    /// Build an entry in place (the only non-IO part of entry creation).
    pub fn new(name: &str, i_no: u32, f_type: FileType) -> Self {
        let mut entry = Self::empty();
        let bytes = name.as_bytes();
        assert!(!bytes.is_empty() && bytes.len() <= MAX_FILE_NAME_LEN);
        let len = bytes.len().min(MAX_FILE_NAME_LEN - 1);
        entry.filename[..len].copy_from_slice(&bytes[..len]);
        entry.i_no = i_no;
        entry.f_type = f_type;
        entry
    }

    pub fn name_str(&self) -> &str {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_FILE_NAME_LEN);
        core::str::from_utf8(&self.filename[..end]).unwrap_or("?")
    }

    pub fn is_used(&self) -> bool {
        self.f_type != FileType::Unknown
    }
}

/// An open directory.
pub struct Dir {
    pub inode: *mut Inode,
    /// Byte cursor for `read_entry`.
    pub dir_pos: u32,
    /// Read-ahead buffer for the sector under the cursor.
    pub dir_buf: [u8; SECTOR_SIZE],
}

impl Dir {
    const fn closed() -> Self {
        Self {
            inode: ptr::null_mut(),
            dir_pos: 0,
            dir_buf: [0; SECTOR_SIZE],
        }
    }
}

struct RootCell(UnsafeCell<Dir>);
unsafe impl Sync for RootCell {}

/// The mounted partition's root directory, opened once and never closed.
static ROOT_DIR: RootCell = RootCell(UnsafeCell::new(Dir::closed()));

pub fn root_dir() -> *mut Dir {
    ROOT_DIR.0.get()
}

/// Directories open for iteration at any one time, system-wide.
pub const MAX_DIR_OPEN: usize = 16;

struct DirTable(UnsafeCell<[*mut Dir; MAX_DIR_OPEN]>);
unsafe impl Sync for DirTable {}

/// Handle table for `opendir`. User space only ever sees indices into this
/// table; every handle-consuming call validates against it, the same way
/// descriptors validate against the task's fd table. A kernel pointer never
/// crosses the syscall boundary.
static DIR_TABLE: DirTable = DirTable(UnsafeCell::new([ptr::null_mut(); MAX_DIR_OPEN]));

fn dir_table() -> &'static mut [*mut Dir; MAX_DIR_OPEN] {
    unsafe { &mut *DIR_TABLE.0.get() }
}

/// Park an open directory in the first free slot; its index is the handle.
pub fn handle_install(dir: *mut Dir) -> Option<usize> {
    assert!(!dir.is_null());
    let table = dir_table();
    for (idx, slot) in table.iter_mut().enumerate() {
        if slot.is_null() {
            *slot = dir;
            return Some(idx);
        }
    }
    None
}

/// Resolve a user-supplied handle; out-of-range and free slots are None.
pub fn handle_get(handle: usize) -> Option<*mut Dir> {
    if handle >= MAX_DIR_OPEN {
        return None;
    }
    let dir = dir_table()[handle];
    if dir.is_null() {
        None
    } else {
        Some(dir)
    }
}

/// Free a handle, returning the directory it named.
pub fn handle_remove(handle: usize) -> Option<*mut Dir> {
    let dir = handle_get(handle)?;
    dir_table()[handle] = ptr::null_mut();
    Some(dir)
}

pub fn open_root_dir(part: *mut Partition) {
    let root = root_dir();
    unsafe {
        let root_inode_no = (*(*part).sb).root_inode_no;
        (*root).inode = inode::open(part, root_inode_no);
        (*root).dir_pos = 0;
    }
}

/// Open directory `inode_no` on `part`.
pub fn open(part: *mut Partition, inode_no: u32) -> *mut Dir {
    let dir = Box::into_raw(Box::new(Dir::closed()));
    unsafe {
        (*dir).inode = inode::open(part, inode_no);
        (*dir).dir_pos = 0;
    }
    dir
}

/// Close a directory handle. The root is shared and stays open.
pub fn close(dir: *mut Dir) {
    if dir == root_dir() {
        return;
    }
    unsafe {
        inode::close((*dir).inode);
        drop(Box::from_raw(dir));
    }
}

/// Scan `dir` for an entry named `name`; copy it into `out` when found.
pub fn search_dir_entry(
    part: *mut Partition,
    dir: *mut Dir,
    name: &str,
    out: &mut DirEntry,
) -> bool {
    let mut all_blocks = Box::new([0u32; MAX_FILE_BLOCKS]);
    unsafe {
        inode::collect_all_blocks(part, (*dir).inode, &mut all_blocks);
    }

    let entry_size = size_of::<DirEntry>();
    let entries_per_sec = SECTOR_SIZE / entry_size;
    let mut buf = vec![0u8; SECTOR_SIZE];

    for &lba in all_blocks.iter() {
        if lba == 0 {
            continue;
        }
        unsafe {
            ide::read((*part).disk, lba, buf.as_mut_ptr(), 1);
        }
        for slot in 0..entries_per_sec {
            let entry = unsafe { &*(buf.as_ptr().add(slot * entry_size) as *const DirEntry) };
            if entry.is_used() && entry.name_str() == name {
                *out = *entry;
                return true;
            }
        }
    }
    false
}

/// Append `entry` to `parent`: reuse the first free slot, or grow the
/// directory by one block (allocating the indirect table the first time
/// block 12 is needed). Every allocation is rolled back on a later failure
/// in the same call.
pub fn sync_dir_entry(
    part: *mut Partition,
    parent: *mut Dir,
    entry: &DirEntry,
    io_buf: &mut [u8],
) -> FsResult<()> {
    let dir_inode = unsafe { (*parent).inode };
    let entry_size = size_of::<DirEntry>();
    unsafe {
        assert_eq!((*dir_inode).i_size as usize % entry_size, 0);
    }
    let entries_per_sec = SECTOR_SIZE / entry_size;

    let mut all_blocks = Box::new([0u32; MAX_FILE_BLOCKS]);
    inode::collect_all_blocks(part, dir_inode, &mut all_blocks);

    for block_idx in 0..MAX_FILE_BLOCKS {
        if all_blocks[block_idx] == 0 {
            // Grow: one fresh data block, plus the indirect table when the
            // 13th block is first needed.
            let Some(block_lba) = file::block_bitmap_alloc(part) else {
                return Err(FsError::NoFreeBlock);
            };
            let sb = unsafe { &*(*part).sb };
            file::bitmap_sync(part, (block_lba - sb.data_start_lba) as usize, BitmapType::Block);

            unsafe {
                if block_idx < DIRECT_SLOTS {
                    (*dir_inode).sectors[block_idx] = block_lba;
                    all_blocks[block_idx] = block_lba;
                } else if block_idx == DIRECT_SLOTS {
                    // The block just allocated becomes the indirect table;
                    // the entry itself needs a second block.
                    (*dir_inode).sectors[DIRECT_SLOTS] = block_lba;
                    let Some(data_lba) = file::block_bitmap_alloc(part) else {
                        // Roll the table allocation back.
                        let bit = (block_lba - sb.data_start_lba) as usize;
                        (*part).block_bitmap.set(bit, false);
                        file::bitmap_sync(part, bit, BitmapType::Block);
                        (*dir_inode).sectors[DIRECT_SLOTS] = 0;
                        return Err(FsError::NoFreeBlock);
                    };
                    file::bitmap_sync(
                        part,
                        (data_lba - sb.data_start_lba) as usize,
                        BitmapType::Block,
                    );
                    all_blocks[DIRECT_SLOTS] = data_lba;
                    ide::write(
                        (*part).disk,
                        (*dir_inode).sectors[DIRECT_SLOTS],
                        all_blocks[DIRECT_SLOTS..].as_ptr() as *const u8,
                        1,
                    );
                } else {
                    all_blocks[block_idx] = block_lba;
                    ide::write(
                        (*part).disk,
                        (*dir_inode).sectors[DIRECT_SLOTS],
                        all_blocks[DIRECT_SLOTS..].as_ptr() as *const u8,
                        1,
                    );
                }

                // First entry of a fresh block.
                io_buf[..SECTOR_SIZE].fill(0);
                ptr::copy_nonoverlapping(
                    entry as *const DirEntry as *const u8,
                    io_buf.as_mut_ptr(),
                    entry_size,
                );
                ide::write((*part).disk, all_blocks[block_idx], io_buf.as_ptr(), 1);
                (*dir_inode).i_size += entry_size as u32;
            }
            return Ok(());
        }

        // Existing block: look for a dead slot.
        unsafe {
            ide::read((*part).disk, all_blocks[block_idx], io_buf.as_mut_ptr(), 1);
        }
        for slot in 0..entries_per_sec {
            let slot_entry =
                unsafe { &mut *(io_buf.as_mut_ptr().add(slot * entry_size) as *mut DirEntry) };
            if !slot_entry.is_used() {
                *slot_entry = *entry;
                unsafe {
                    ide::write((*part).disk, all_blocks[block_idx], io_buf.as_ptr(), 1);
                    (*dir_inode).i_size += entry_size as u32;
                }
                return Ok(());
            }
        }
    }
    Err(FsError::DirFull)
}

/// Remove the entry of inode `inode_no` from `dir`: zero it in place, or
/// free its block entirely when it was the only occupant (the directory's
/// first block is always retained; an emptied indirect table is freed too).
pub fn delete_dir_entry(
    part: *mut Partition,
    dir: *mut Dir,
    inode_no: u32,
    io_buf: &mut [u8],
) -> bool {
    let dir_inode = unsafe { (*dir).inode };
    let entry_size = size_of::<DirEntry>();
    let entries_per_sec = SECTOR_SIZE / entry_size;

    let mut all_blocks = Box::new([0u32; MAX_FILE_BLOCKS]);
    inode::collect_all_blocks(part, dir_inode, &mut all_blocks);

    for block_idx in 0..MAX_FILE_BLOCKS {
        let lba = all_blocks[block_idx];
        if lba == 0 {
            continue;
        }
        unsafe {
            ide::read((*part).disk, lba, io_buf.as_mut_ptr(), 1);
        }

        let mut found: Option<usize> = None;
        let mut live_others = 0;
        for slot in 0..entries_per_sec {
            let entry = unsafe { &*(io_buf.as_ptr().add(slot * entry_size) as *const DirEntry) };
            if !entry.is_used() {
                continue;
            }
            if entry.name_str() == "." || entry.name_str() == ".." {
                continue;
            }
            if entry.i_no == inode_no {
                found = Some(slot);
            } else {
                live_others += 1;
            }
        }
        let Some(slot) = found else { continue };

        unsafe {
            let sb = &*(*part).sb;
            if live_others == 0 && block_idx != 0 {
                // Sole occupant of a non-first block: give the block back.
                let bit = (lba - sb.data_start_lba) as usize;
                (*part).block_bitmap.set(bit, false);
                file::bitmap_sync(part, bit, BitmapType::Block);

                if block_idx < DIRECT_SLOTS {
                    (*dir_inode).sectors[block_idx] = 0;
                } else {
                    all_blocks[block_idx] = 0;
                    let indirect_live = all_blocks[DIRECT_SLOTS..].iter().any(|&b| b != 0);
                    let indirect_lba = (*dir_inode).sectors[DIRECT_SLOTS];
                    if indirect_live {
                        ide::write(
                            (*part).disk,
                            indirect_lba,
                            all_blocks[DIRECT_SLOTS..].as_ptr() as *const u8,
                            1,
                        );
                    } else {
                        // Last indirect block gone: free the table itself.
                        let bit = (indirect_lba - sb.data_start_lba) as usize;
                        (*part).block_bitmap.set(bit, false);
                        file::bitmap_sync(part, bit, BitmapType::Block);
                        (*dir_inode).sectors[DIRECT_SLOTS] = 0;
                    }
                }
            } else {
                // Zero the entry in place.
                ptr::write_bytes(io_buf.as_mut_ptr().add(slot * entry_size), 0, entry_size);
                ide::write((*part).disk, lba, io_buf.as_ptr(), 1);
            }

            (*dir_inode).i_size -= entry_size as u32;
            let mut sync_buf = vec![0u8; 2 * SECTOR_SIZE];
            inode::sync(part, dir_inode, &mut sync_buf);
        }
        return true;
    }
    false
}

/// Return the entry under the cursor and advance it, skipping dead slots.
pub fn read_entry(part: *mut Partition, dir: *mut Dir) -> Option<*mut DirEntry> {
    let dir_inode = unsafe { (*dir).inode };
    let entry_size = size_of::<DirEntry>();
    let entries_per_sec = SECTOR_SIZE / entry_size;

    unsafe {
        if (*dir).dir_pos >= (*dir_inode).i_size {
            return None;
        }
    }

    let mut all_blocks = Box::new([0u32; MAX_FILE_BLOCKS]);
    inode::collect_all_blocks(part, dir_inode, &mut all_blocks);

    let mut cur_pos: u32 = 0;
    for &lba in all_blocks.iter() {
        if lba == 0 {
            continue;
        }
        unsafe {
            ide::read((*part).disk, lba, (*dir).dir_buf.as_mut_ptr(), 1);
        }
        for slot in 0..entries_per_sec {
            let entry =
                unsafe { &mut *((*dir).dir_buf.as_mut_ptr().add(slot * entry_size) as *mut DirEntry) };
            if !entry.is_used() {
                continue;
            }
            unsafe {
                if cur_pos < (*dir).dir_pos {
                    cur_pos += entry_size as u32;
                    continue;
                }
                assert_eq!(cur_pos, (*dir).dir_pos);
                (*dir).dir_pos += entry_size as u32;
            }
            return Some(entry);
        }
    }
    None
}

/// A directory with only `.` and `..` left.
pub fn is_empty(dir: *mut Dir) -> bool {
    unsafe { (*(*dir).inode).i_size as usize == 2 * size_of::<DirEntry>() }
}

/// Remove empty `child` from `parent`: entry, blocks and inode.
pub fn remove(part: *mut Partition, parent: *mut Dir, child: *mut Dir) -> FsResult<()> {
    assert!(is_empty(child));
    let child_inode_no = unsafe { (*(*child).inode).i_no };
    let mut io_buf = vec![0u8; SECTOR_SIZE];
    if !delete_dir_entry(part, parent, child_inode_no, &mut io_buf) {
        return Err(FsError::NotFound);
    }
    inode::release(part, child_inode_no);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_24_bytes_and_packs_per_sector() {
        assert_eq!(size_of::<DirEntry>(), 24);
        // 21 entries per sector, none straddling.
        assert_eq!(SECTOR_SIZE / size_of::<DirEntry>(), 21);
    }

    #[test]
    fn entry_name_is_nul_padded() {
        let entry = DirEntry::new("kernel.bin", 7, FileType::Regular);
        assert_eq!(entry.name_str(), "kernel.bin");
        assert_eq!(entry.filename[10], 0);
        assert_eq!(entry.i_no, 7);
        assert!(entry.is_used());
    }

    #[test]
    fn unknown_type_marks_free_slot() {
        let entry = DirEntry::empty();
        assert!(!entry.is_used());
    }

    #[test]
    fn handle_table_round_trip() {
        let dir = Box::into_raw(Box::new(Dir::closed()));
        let handle = handle_install(dir).unwrap();
        assert_eq!(handle_get(handle), Some(dir));
        // Out-of-range and never-installed handles resolve to nothing.
        assert_eq!(handle_get(MAX_DIR_OPEN), None);
        assert_eq!(handle_get(MAX_DIR_OPEN - 1), None);
        assert_eq!(handle_remove(handle), Some(dir));
        // A freed handle is dead until reused by a later install.
        assert_eq!(handle_get(handle), None);
        assert_eq!(handle_remove(handle), None);
        unsafe { drop(Box::from_raw(dir)) };
    }
}
