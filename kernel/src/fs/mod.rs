//! File-system core: format, mount, path resolution and the `sys_*`
//! operations the syscall layer exposes.
//!
//! On-disk layout per partition, in LBA order: boot sector, superblock,
//! block bitmap, inode bitmap, inode table, data area. Blocks equal
//! sectors equal 512 bytes. One partition is mounted at a time; paths are
//! absolute or relative to the running task's working directory.

pub mod dir;
pub mod file;
pub mod inode;
pub mod superblock;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::size_of;
use core::ptr;

use crate::elem2entry;
use crate::fs::dir::{Dir, DirEntry, FileType, MAX_FILE_NAME_LEN};
use crate::fs::inode::{DiskInode, Inode};
use crate::fs::superblock::{SuperBlock, SECTOR_SIZE, SUPER_BLOCK_MAGIC};
use crate::ide::{self, Partition};
use crate::thread;

pub const MAX_PATH_LEN: usize = 512;

/// Partition mounted as the default file system.
const DEFAULT_PART: &str = "sdb1";

bitflags! {
    /// `open` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        const WRONLY = 1;
        const RDWR = 2;
        const CREAT = 4;
    }
}

impl OpenFlags {
    /// Read-only is the absence of the write bits.
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// Failure kinds surfaced by the file system. The syscall boundary folds
/// them all into `-1`; the names exist for kernel-side logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NoFreeInode,
    NoFreeBlock,
    NoFreeFileSlot,
    NoFreeFd,
    NotFound,
    ParentNotFound,
    IsADirectory,
    NotADirectory,
    AlreadyExists,
    WriteDeny,
    InvalidArgument,
    DirFull,
    DirNotEmpty,
    NoFreeDirHandle,
    InUse,
    BadPath,
    NoFilesystem,
}

impl FsError {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsError::NoFreeInode => "no free inode",
            FsError::NoFreeBlock => "no free block",
            FsError::NoFreeFileSlot => "open-file table full",
            FsError::NoFreeFd => "task descriptor table full",
            FsError::NotFound => "not found",
            FsError::ParentNotFound => "parent directory not found",
            FsError::IsADirectory => "is a directory",
            FsError::NotADirectory => "not a directory",
            FsError::AlreadyExists => "already exists",
            FsError::WriteDeny => "file is being written",
            FsError::InvalidArgument => "invalid argument",
            FsError::DirFull => "directory is full",
            FsError::DirNotEmpty => "directory not empty",
            FsError::NoFreeDirHandle => "directory handle table full",
            FsError::InUse => "in use",
            FsError::BadPath => "bad path",
            FsError::NoFilesystem => "no file system mounted",
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// `stat` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub size: u32,
    pub f_type: FileType,
}

struct PartCell(UnsafeCell<*mut Partition>);
unsafe impl Sync for PartCell {}

static CUR_PART: PartCell = PartCell(UnsafeCell::new(ptr::null_mut()));

/// The mounted partition.
pub fn cur_part() -> *mut Partition {
    let part = unsafe { *CUR_PART.0.get() };
    assert!(!part.is_null(), "no partition mounted");
    part
}

pub fn is_mounted() -> bool {
    unsafe { !(*CUR_PART.0.get()).is_null() }
}

// ============================================================================
// Paths
// ============================================================================

/// Split off the first path component: `"/a/b" → ("a", "/b")`.
pub fn path_parse(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, ""),
    }
}

/// Number of components in `path`.
pub fn path_depth_cnt(path: &str) -> usize {
    let mut depth = 0;
    let (mut name, mut rest) = path_parse(path);
    while !name.is_empty() {
        depth += 1;
        let (next_name, next_rest) = path_parse(rest);
        name = next_name;
        rest = next_rest;
    }
    depth
}

/// Prefix relative paths with the task's working directory.
fn make_absolute(path: &str) -> FsResult<String> {
    if path.is_empty() || path.len() >= MAX_PATH_LEN {
        return Err(FsError::BadPath);
    }
    if path.starts_with('/') {
        return Ok(String::from(path));
    }
    let mut abs = sys_getcwd()?;
    if !abs.ends_with('/') {
        abs.push('/');
    }
    abs.push_str(path);
    Ok(abs)
}

/// What the resolver learned while walking a path.
pub struct PathSearchRecord {
    /// The prefix actually traversed; on failure it ends at the component
    /// that was missing, which distinguishes "does not exist" from "parent
    /// does not exist".
    pub searched_path: String,
    /// Open handle on the direct parent of the last component examined.
    /// The caller owns the close.
    pub parent_dir: *mut Dir,
    pub file_type: FileType,
}

impl PathSearchRecord {
    fn new() -> Self {
        Self {
            searched_path: String::new(),
            parent_dir: dir::root_dir(),
            file_type: FileType::Unknown,
        }
    }
}

/// Walk `path` (absolute) from the root. On success returns the inode of
/// the final component with `record.file_type` telling regular from
/// directory; on failure `record` pins down how far the walk got.
fn search_file(path: &str, record: &mut PathSearchRecord) -> FsResult<u32> {
    let part = cur_part();

    if path == "/" || path == "/." || path == "/.." {
        record.parent_dir = dir::root_dir();
        record.file_type = FileType::Directory;
        record.searched_path.clear();
        return Ok(unsafe { (*(*part).sb).root_inode_no });
    }
    assert!(path.starts_with('/') && path.len() > 1 && path.len() < MAX_PATH_LEN);

    let mut parent = dir::root_dir();
    record.parent_dir = parent;
    record.file_type = FileType::Unknown;
    record.searched_path.clear();

    let (mut name, mut rest) = path_parse(path);
    let mut entry = DirEntry::empty();

    while !name.is_empty() {
        if name.len() > MAX_FILE_NAME_LEN {
            return Err(FsError::BadPath);
        }
        record.searched_path.push('/');
        record.searched_path.push_str(name);

        if !dir::search_dir_entry(part, parent, name, &mut entry) {
            return Err(FsError::NotFound);
        }

        let at_end = rest.trim_start_matches('/').is_empty();
        if at_end {
            record.file_type = entry.f_type;
            return Ok(entry.i_no);
        }

        match entry.f_type {
            FileType::Directory => {
                dir::close(parent);
                parent = dir::open(part, entry.i_no);
                record.parent_dir = parent;
                let (next_name, next_rest) = path_parse(rest);
                name = next_name;
                rest = next_rest;
            }
            _ => {
                // A regular file in the middle of the path.
                record.file_type = FileType::Regular;
                return Err(FsError::NotADirectory);
            }
        }
    }
    Err(FsError::BadPath)
}

/// Last component of an absolute path.
fn final_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

// ============================================================================
// File operations
// ============================================================================

/// Map a task-local descriptor (≥ 3) to its open-file table index.
fn fd_local2global(fd: usize) -> FsResult<usize> {
    if !(3..thread::MAX_FILES_OPEN_PER_PROC).contains(&fd) {
        return Err(FsError::InvalidArgument);
    }
    let cur = thread::running_task();
    let global = unsafe { (*cur).fd_table[fd] };
    if !(3..MAX_FILE_OPEN_I32).contains(&global) {
        return Err(FsError::InvalidArgument);
    }
    Ok(global as usize)
}

const MAX_FILE_OPEN_I32: i32 = file::MAX_FILE_OPEN as i32;

/// Open (or with `CREAT`, create) the regular file at `path`.
pub fn sys_open(path: &str, flags: OpenFlags) -> FsResult<usize> {
    if path.ends_with('/') {
        return Err(FsError::IsADirectory);
    }
    let abs = make_absolute(path)?;
    let part = cur_part();

    let mut record = PathSearchRecord::new();
    let result = search_file(&abs, &mut record);

    let outcome = match result {
        Ok(_) if record.file_type == FileType::Directory => Err(FsError::IsADirectory),
        Ok(inode_no) => {
            if flags.contains(OpenFlags::CREAT) {
                crate::log_warn!("[FS] {}: already exists", abs);
                Err(FsError::AlreadyExists)
            } else {
                file::file_open(part, inode_no, flags)
            }
        }
        Err(FsError::NotFound) => {
            let searched_depth = path_depth_cnt(&record.searched_path);
            if path_depth_cnt(&abs) != searched_depth {
                // Some intermediate directory is missing.
                Err(FsError::ParentNotFound)
            } else if flags.contains(OpenFlags::CREAT) {
                file::file_create(part, record.parent_dir, final_name(&abs), flags)
            } else {
                crate::log_warn!("[FS] {}: not found", abs);
                Err(FsError::NotFound)
            }
        }
        Err(err) => Err(err),
    };
    dir::close(record.parent_dir);
    outcome
}

/// Close descriptor `fd` and free the task slot.
pub fn sys_close(fd: usize) -> FsResult<()> {
    let global = fd_local2global(fd)?;
    file::file_close(&mut file::file_table()[global]);
    let cur = thread::running_task();
    unsafe {
        (*cur).fd_table[fd] = -1;
    }
    Ok(())
}

/// Write to a descriptor: 1/2 reach the console, ≥ 3 reach files.
pub fn sys_write(fd: usize, buf: &[u8]) -> FsResult<usize> {
    match fd {
        1 | 2 => Ok(crate::console::write(buf)),
        0 => Err(FsError::InvalidArgument),
        _ => {
            let global = fd_local2global(fd)?;
            let table = file::file_table();
            let flags = OpenFlags::from_bits_truncate(table[global].fd_flag as u8);
            if !flags.writable() {
                crate::log_warn!("[FS] fd {} not opened for writing", fd);
                return Err(FsError::InvalidArgument);
            }
            let entry = &mut table[global];
            file::file_write(cur_part(), entry, buf)
        }
    }
}

/// Read from a descriptor: 0 blocks on the keyboard, ≥ 3 reads files.
pub fn sys_read(fd: usize, buf: &mut [u8]) -> FsResult<usize> {
    if buf.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    match fd {
        0 => Ok(crate::console::read(buf)),
        1 | 2 => Err(FsError::InvalidArgument),
        _ => {
            let global = fd_local2global(fd)?;
            let entry = &mut file::file_table()[global];
            file::file_read(cur_part(), entry, buf)
        }
    }
}

/// `lseek` origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Whence {
    Set = 1,
    Cur = 2,
    End = 3,
}

impl Whence {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Whence::Set),
            2 => Some(Whence::Cur),
            3 => Some(Whence::End),
            _ => None,
        }
    }
}

/// Reposition `fd`; the result is clamped to `[0, size]`.
pub fn sys_lseek(fd: usize, offset: i32, whence: Whence) -> FsResult<u32> {
    let global = fd_local2global(fd)?;
    let entry = &mut file::file_table()[global];
    let size = unsafe { (*entry.fd_inode).i_size } as i32;
    let base = match whence {
        Whence::Set => 0,
        Whence::Cur => entry.fd_pos as i32,
        Whence::End => size,
    };
    let new_pos = (base + offset).clamp(0, size) as u32;
    entry.fd_pos = new_pos;
    Ok(new_pos)
}

/// Delete the regular file at `path`. Open files are protected.
pub fn sys_unlink(path: &str) -> FsResult<()> {
    let abs = make_absolute(path)?;
    let part = cur_part();

    let mut record = PathSearchRecord::new();
    let outcome = (|| {
        let inode_no = search_file(&abs, &mut record)?;
        if record.file_type == FileType::Directory {
            crate::log_warn!("[FS] {}: is a directory, use rmdir", abs);
            return Err(FsError::IsADirectory);
        }
        // Refuse while any table entry holds the inode.
        let open = file::file_table()
            .iter()
            .any(|f| !f.fd_inode.is_null() && unsafe { (*f.fd_inode).i_no } == inode_no);
        if open {
            crate::log_warn!("[FS] {}: still open", abs);
            return Err(FsError::InUse);
        }

        let mut io_buf = vec![0u8; SECTOR_SIZE];
        let deleted = dir::delete_dir_entry(part, record.parent_dir, inode_no, &mut io_buf);
        assert!(deleted);
        inode::release(part, inode_no);
        Ok(())
    })();
    dir::close(record.parent_dir);
    outcome
}

/// Create the directory at `path`, including its `.`/`..` block. Failures
/// roll back in reverse allocation order.
pub fn sys_mkdir(path: &str) -> FsResult<()> {
    let abs = make_absolute(path)?;
    let part = cur_part();

    let mut record = PathSearchRecord::new();
    let outcome = (|| {
        match search_file(&abs, &mut record) {
            Ok(_) => {
                crate::log_warn!("[FS] {}: already exists", abs);
                return Err(FsError::AlreadyExists);
            }
            Err(FsError::NotFound) => {
                if path_depth_cnt(&abs) != path_depth_cnt(&record.searched_path) {
                    return Err(FsError::ParentNotFound);
                }
            }
            Err(err) => return Err(err),
        }

        let name = final_name(&abs);
        let Some(inode_no) = file::inode_bitmap_alloc(part) else {
            return Err(FsError::NoFreeInode);
        };
        let mut dir_inode = Inode::new(inode_no);

        let Some(block_lba) = file::block_bitmap_alloc(part) else {
            unsafe { (*part).inode_bitmap.set(inode_no as usize, false) };
            return Err(FsError::NoFreeBlock);
        };
        let sb = unsafe { &*(*part).sb };
        file::bitmap_sync(part, (block_lba - sb.data_start_lba) as usize, file::BitmapType::Block);

        dir_inode.sectors[0] = block_lba;
        dir_inode.i_size = 2 * size_of::<DirEntry>() as u32;

        // Seed the first block with `.` and `..`.
        let parent_inode_no = unsafe { (*(*record.parent_dir).inode).i_no };
        let mut block = vec![0u8; SECTOR_SIZE];
        let dot = DirEntry::new(".", inode_no, FileType::Directory);
        let dotdot = DirEntry::new("..", parent_inode_no, FileType::Directory);
        unsafe {
            ptr::copy_nonoverlapping(
                &dot as *const DirEntry as *const u8,
                block.as_mut_ptr(),
                size_of::<DirEntry>(),
            );
            ptr::copy_nonoverlapping(
                &dotdot as *const DirEntry as *const u8,
                block.as_mut_ptr().add(size_of::<DirEntry>()),
                size_of::<DirEntry>(),
            );
            ide::write((*part).disk, block_lba, block.as_ptr(), 1);
        }

        let entry = DirEntry::new(name, inode_no, FileType::Directory);
        let mut io_buf = vec![0u8; 2 * SECTOR_SIZE];
        if let Err(err) = dir::sync_dir_entry(part, record.parent_dir, &entry, &mut io_buf) {
            // Unwind the block and inode claims.
            unsafe {
                let bit = (block_lba - sb.data_start_lba) as usize;
                (*part).block_bitmap.set(bit, false);
                file::bitmap_sync(part, bit, file::BitmapType::Block);
                (*part).inode_bitmap.set(inode_no as usize, false);
            }
            return Err(err);
        }

        unsafe {
            io_buf.fill(0);
            inode::sync(part, (*record.parent_dir).inode, &mut io_buf);
            io_buf.fill(0);
            inode::sync(part, &mut dir_inode, &mut io_buf);
        }
        file::bitmap_sync(part, inode_no as usize, file::BitmapType::Inode);
        Ok(())
    })();
    dir::close(record.parent_dir);
    outcome
}

/// Open the directory at `path` for `readdir`. Returns a handle into the
/// kernel's directory table, never the directory's address.
pub fn sys_opendir(path: &str) -> FsResult<usize> {
    let abs = make_absolute(path)?;
    let part = cur_part();

    let dir_ptr = if abs == "/" || abs == "/." || abs == "/.." {
        dir::root_dir()
    } else {
        let mut record = PathSearchRecord::new();
        let outcome = match search_file(&abs, &mut record) {
            Ok(inode_no) if record.file_type == FileType::Directory => {
                Ok(dir::open(part, inode_no))
            }
            Ok(_) => {
                crate::log_warn!("[FS] {}: not a directory", abs);
                Err(FsError::NotADirectory)
            }
            Err(err) => Err(err),
        };
        dir::close(record.parent_dir);
        outcome?
    };

    match dir::handle_install(dir_ptr) {
        Some(handle) => Ok(handle),
        None => {
            dir::close(dir_ptr);
            crate::log_warn!("[FS] {}: directory handle table full", abs);
            Err(FsError::NoFreeDirHandle)
        }
    }
}

/// Release a directory handle.
pub fn sys_closedir(handle: usize) -> FsResult<()> {
    let Some(dir_ptr) = dir::handle_remove(handle) else {
        return Err(FsError::InvalidArgument);
    };
    dir::close(dir_ptr);
    Ok(())
}

/// Copy of the next live entry of an open directory, or None at the end.
pub fn sys_readdir(handle: usize) -> FsResult<Option<DirEntry>> {
    let Some(dir_ptr) = dir::handle_get(handle) else {
        return Err(FsError::InvalidArgument);
    };
    Ok(dir::read_entry(cur_part(), dir_ptr).map(|entry| unsafe { *entry }))
}

/// Reset a handle's cursor to the first entry.
pub fn sys_rewinddir(handle: usize) -> FsResult<()> {
    let Some(dir_ptr) = dir::handle_get(handle) else {
        return Err(FsError::InvalidArgument);
    };
    unsafe {
        (*dir_ptr).dir_pos = 0;
    }
    Ok(())
}

/// Remove the empty directory at `path`.
pub fn sys_rmdir(path: &str) -> FsResult<()> {
    let abs = make_absolute(path)?;
    let part = cur_part();

    let mut record = PathSearchRecord::new();
    let outcome = (|| {
        let inode_no = search_file(&abs, &mut record)?;
        if record.file_type != FileType::Directory {
            crate::log_warn!("[FS] {}: not a directory", abs);
            return Err(FsError::NotADirectory);
        }
        if inode_no == unsafe { (*(*part).sb).root_inode_no } {
            return Err(FsError::InvalidArgument);
        }
        let child = dir::open(part, inode_no);
        let result = if !dir::is_empty(child) {
            crate::log_warn!("[FS] {}: not empty", abs);
            Err(FsError::DirNotEmpty)
        } else {
            dir::remove(part, record.parent_dir, child)
        };
        dir::close(child);
        result
    })();
    dir::close(record.parent_dir);
    outcome
}

/// Inode number of `child_inode_no`'s parent, read from its `..` entry.
fn get_parent_dir_inode_nr(part: *mut Partition, child_inode_no: u32, io_buf: &mut [u8]) -> u32 {
    let child = inode::open(part, child_inode_no);
    let block_lba = unsafe { (*child).sectors[0] };
    inode::close(child);
    assert!(block_lba >= unsafe { (*(*part).sb).data_start_lba });

    unsafe {
        ide::read((*part).disk, block_lba, io_buf.as_mut_ptr(), 1);
    }
    // Entry 0 is `.`, entry 1 is `..`.
    let dotdot = unsafe { &*(io_buf.as_ptr().add(size_of::<DirEntry>()) as *const DirEntry) };
    assert_eq!(dotdot.f_type, FileType::Directory);
    dotdot.i_no
}

/// Find `child_inode_no`'s name inside directory `parent_inode_no`.
fn get_child_dir_name(
    part: *mut Partition,
    parent_inode_no: u32,
    child_inode_no: u32,
) -> Option<String> {
    let parent = dir::open(part, parent_inode_no);
    let mut all_blocks = Box::new([0u32; inode::MAX_FILE_BLOCKS]);
    unsafe {
        inode::collect_all_blocks(part, (*parent).inode, &mut all_blocks);
    }

    let entry_size = size_of::<DirEntry>();
    let entries_per_sec = SECTOR_SIZE / entry_size;
    let mut io_buf = vec![0u8; SECTOR_SIZE];
    let mut found = None;

    'outer: for &lba in all_blocks.iter() {
        if lba == 0 {
            continue;
        }
        unsafe {
            ide::read((*part).disk, lba, io_buf.as_mut_ptr(), 1);
        }
        for slot in 0..entries_per_sec {
            let entry = unsafe { &*(io_buf.as_ptr().add(slot * entry_size) as *const DirEntry) };
            if entry.is_used() && entry.i_no == child_inode_no && entry.name_str() != "." {
                found = Some(String::from(entry.name_str()));
                break 'outer;
            }
        }
    }
    dir::close(parent);
    found
}

/// Absolute path of the task's working directory.
pub fn sys_getcwd() -> FsResult<String> {
    let part = cur_part();
    let cur = thread::running_task();
    let mut child_inode_no = unsafe { (*cur).cwd_inode_nr } as u32;

    let root_inode_no = unsafe { (*(*part).sb).root_inode_no };
    if child_inode_no == root_inode_no {
        return Ok(String::from("/"));
    }

    let mut io_buf = vec![0u8; SECTOR_SIZE];
    let mut names: Vec<String> = Vec::new();
    while child_inode_no != root_inode_no {
        let parent_inode_no = get_parent_dir_inode_nr(part, child_inode_no, &mut io_buf);
        let Some(name) = get_child_dir_name(part, parent_inode_no, child_inode_no) else {
            return Err(FsError::NotFound);
        };
        names.push(name);
        child_inode_no = parent_inode_no;
    }

    let mut path = String::new();
    for name in names.iter().rev() {
        path.push('/');
        path.push_str(name);
    }
    Ok(path)
}

/// Change the task's working directory.
pub fn sys_chdir(path: &str) -> FsResult<()> {
    let abs = make_absolute(path)?;
    let mut record = PathSearchRecord::new();
    let outcome = (|| {
        let inode_no = search_file(&abs, &mut record)?;
        if record.file_type != FileType::Directory {
            crate::log_warn!("[FS] {}: not a directory", abs);
            return Err(FsError::NotADirectory);
        }
        let cur = thread::running_task();
        unsafe {
            (*cur).cwd_inode_nr = inode_no as i32;
        }
        Ok(())
    })();
    dir::close(record.parent_dir);
    outcome
}

/// Attributes of the object at `path`.
pub fn sys_stat(path: &str) -> FsResult<Stat> {
    let abs = make_absolute(path)?;
    let part = cur_part();

    if abs == "/" || abs == "/." || abs == "/.." {
        let root = dir::root_dir();
        let size = unsafe { (*(*root).inode).i_size };
        return Ok(Stat {
            ino: unsafe { (*(*part).sb).root_inode_no },
            size,
            f_type: FileType::Directory,
        });
    }

    let mut record = PathSearchRecord::new();
    let outcome = (|| {
        let inode_no = search_file(&abs, &mut record)?;
        let node = inode::open(part, inode_no);
        let size = unsafe { (*node).i_size };
        inode::close(node);
        Ok(Stat { ino: inode_no, size, f_type: record.file_type })
    })();
    dir::close(record.parent_dir);
    outcome
}

// ============================================================================
// Format and mount
// ============================================================================

/// Write a fresh file system onto `part`: superblock, both bitmaps, the
/// root inode and the root's `.`/`..` block.
fn format_partition(part: *mut Partition) {
    let (part_name, start_lba, sec_cnt, hd) = unsafe {
        (
            (*part).name_str(),
            (*part).start_lba,
            (*part).sec_cnt,
            (*part).disk,
        )
    };
    let sb = SuperBlock::compute(start_lba, sec_cnt);

    let block_bitmap_lba = sb.block_bitmap_lba;
    let block_bitmap_sects = sb.block_bitmap_sects;
    let inode_bitmap_lba = sb.inode_bitmap_lba;
    let inode_table_lba = sb.inode_table_lba;
    let data_start_lba = sb.data_start_lba;
    crate::log!(
        "[FS] formatting {}: block bitmap {:#x}, inode bitmap {:#x}, inode table {:#x}, data {:#x}",
        part_name,
        block_bitmap_lba,
        inode_bitmap_lba,
        inode_table_lba,
        data_start_lba
    );

    unsafe {
        // Superblock at the second sector of the partition.
        ide::write(hd, start_lba + 1, &sb as *const SuperBlock as *const u8, 1);

        // Block bitmap: bit 0 is the root's block; the slack past the data
        // area is marked used so it can never be allocated.
        let mut block_bitmap = vec![0u8; block_bitmap_sects as usize * SECTOR_SIZE];
        block_bitmap[0] |= 0x01;
        let bit_len = sb.block_bitmap_bit_len();
        for bit in bit_len..block_bitmap.len() * 8 {
            block_bitmap[bit / 8] |= 1 << (bit % 8);
        }
        ide::write(hd, block_bitmap_lba, block_bitmap.as_ptr(), block_bitmap_sects as usize);

        // Inode bitmap: bit 0 is the root inode.
        let inode_bitmap_sects = sb.inode_bitmap_sects;
        let mut inode_bitmap = vec![0u8; inode_bitmap_sects as usize * SECTOR_SIZE];
        inode_bitmap[0] |= 0x01;
        ide::write(hd, inode_bitmap_lba, inode_bitmap.as_ptr(), inode_bitmap_sects as usize);

        // Inode table: only the root inode is live.
        let mut table_sector = vec![0u8; SECTOR_SIZE];
        let root = DiskInode {
            i_no: 0,
            i_size: 2 * size_of::<DirEntry>() as u32,
            sectors: {
                let mut sectors = [0u32; inode::INODE_SLOTS];
                sectors[0] = data_start_lba;
                sectors
            },
        };
        ptr::copy_nonoverlapping(
            &root as *const DiskInode as *const u8,
            table_sector.as_mut_ptr(),
            size_of::<DiskInode>(),
        );
        ide::write(hd, inode_table_lba, table_sector.as_ptr(), 1);

        // Root directory block: `.` and `..` both point at the root.
        let mut root_block = vec![0u8; SECTOR_SIZE];
        let dot = DirEntry::new(".", 0, FileType::Directory);
        let dotdot = DirEntry::new("..", 0, FileType::Directory);
        ptr::copy_nonoverlapping(
            &dot as *const DirEntry as *const u8,
            root_block.as_mut_ptr(),
            size_of::<DirEntry>(),
        );
        ptr::copy_nonoverlapping(
            &dotdot as *const DirEntry as *const u8,
            root_block.as_mut_ptr().add(size_of::<DirEntry>()),
            size_of::<DirEntry>(),
        );
        ide::write(hd, data_start_lba, root_block.as_ptr(), 1);
    }
    crate::log!("[FS] {} formatted", part_name);
}

/// Load `name`'s superblock and bitmaps into memory and make it current.
fn mount_partition(name: &str) -> FsResult<()> {
    let Some(part) = ide::partition_by_name(name) else {
        return Err(FsError::NoFilesystem);
    };
    unsafe {
        let hd = (*part).disk;

        let mut sb_buf = Box::new([0u8; SECTOR_SIZE]);
        ide::read(hd, (*part).start_lba + 1, sb_buf.as_mut_ptr(), 1);
        let sb = Box::into_raw(sb_buf) as *mut SuperBlock;
        assert_eq!(
            { (*sb).magic },
            SUPER_BLOCK_MAGIC,
            "superblock magic mismatch: on-disk corruption"
        );
        (*part).sb = sb;

        let block_bm_len = (*sb).block_bitmap_sects as usize * SECTOR_SIZE;
        let block_bits = vec![0u8; block_bm_len].leak();
        (*part).block_bitmap.reset(block_bits.as_mut_ptr(), block_bm_len);
        ide::read(hd, (*sb).block_bitmap_lba, block_bits.as_mut_ptr(), (*sb).block_bitmap_sects as usize);

        let inode_bm_len = (*sb).inode_bitmap_sects as usize * SECTOR_SIZE;
        let inode_bits = vec![0u8; inode_bm_len].leak();
        (*part).inode_bitmap.reset(inode_bits.as_mut_ptr(), inode_bm_len);
        ide::read(hd, (*sb).inode_bitmap_lba, inode_bits.as_mut_ptr(), (*sb).inode_bitmap_sects as usize);

        (*part).open_inodes.init();

        *CUR_PART.0.get() = part;
        crate::log!("[FS] mounted {}", (*part).name_str());
    }
    Ok(())
}

/// Format any virgin partition, mount the default one, open its root.
pub fn init() {
    let mut sb_buf = vec![0u8; SECTOR_SIZE];
    for elem in ide::partition_list().iter() {
        let part = elem2entry!(Partition, tag, elem);
        unsafe {
            ide::read((*part).disk, (*part).start_lba + 1, sb_buf.as_mut_ptr(), 1);
            let magic = u32::from_le_bytes([sb_buf[0], sb_buf[1], sb_buf[2], sb_buf[3]]);
            if magic == SUPER_BLOCK_MAGIC {
                crate::log!("[FS] {} already has a file system", (*part).name_str());
            } else {
                format_partition(part);
            }
        }
    }

    match mount_partition(DEFAULT_PART) {
        Ok(()) => {
            dir::open_root_dir(cur_part());
            crate::log!("[FS] ready, root open on {}", DEFAULT_PART);
        }
        Err(_) => {
            crate::log_warn!("[FS] default partition {} not present", DEFAULT_PART);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parse_peels_components() {
        let (name, rest) = path_parse("/a/b/c");
        assert_eq!(name, "a");
        assert_eq!(rest, "/b/c");
        let (name, rest) = path_parse(rest);
        assert_eq!(name, "b");
        assert_eq!(rest, "/c");
        let (name, rest) = path_parse(rest);
        assert_eq!(name, "c");
        assert_eq!(rest, "");
    }

    #[test]
    fn depth_ignores_duplicate_slashes() {
        assert_eq!(path_depth_cnt("/"), 0);
        assert_eq!(path_depth_cnt("/a"), 1);
        assert_eq!(path_depth_cnt("/a//b/c"), 3);
    }

    #[test]
    fn final_component() {
        assert_eq!(final_name("/a/b/c.txt"), "c.txt");
        assert_eq!(final_name("/top"), "top");
    }

    #[test]
    fn open_flag_bits_match_the_abi() {
        assert_eq!(OpenFlags::RDONLY.bits(), 0);
        assert_eq!(OpenFlags::WRONLY.bits(), 1);
        assert_eq!(OpenFlags::RDWR.bits(), 2);
        assert_eq!(OpenFlags::CREAT.bits(), 4);
        assert!((OpenFlags::RDWR | OpenFlags::CREAT).writable());
        assert!(!OpenFlags::RDONLY.writable());
    }

    #[test]
    fn whence_decodes() {
        assert_eq!(Whence::from_raw(1), Some(Whence::Set));
        assert_eq!(Whence::from_raw(3), Some(Whence::End));
        assert_eq!(Whence::from_raw(0), None);
    }
}
