//! Inodes: on-disk layout, the in-memory cache and write-back.
//!
//! The persisted inode is 60 packed bytes: number, byte size and 13 sector
//! slots (12 direct, the 13th a single-indirect table). The in-memory
//! [`Inode`] adds the open count, the writer-exclusion flag and its link in
//! the partition's open-inodes list; `sync` writes back only the persisted
//! subset.
//!
//! Inodes load on first open and evict when the open count drops to zero.
//! The cache structures always come off the kernel heap (the global
//! allocator draws from the kernel pool), so every process sees the same
//! cached inode regardless of whose page tables are live.

use alloc::boxed::Box;
use alloc::vec;
use core::mem::size_of;

use crate::elem2entry;
use crate::fs::superblock::SECTOR_SIZE;
use crate::ide::{self, Partition};
use crate::interrupts;
use crate::list::ListElem;

/// Direct slots plus the single-indirect slot.
pub const INODE_SLOTS: usize = 13;
pub const DIRECT_SLOTS: usize = 12;
/// 4-byte LBAs in the single-indirect block.
pub const INDIRECT_PER_BLOCK: usize = SECTOR_SIZE / 4;
/// Most data blocks a file can address.
pub const MAX_FILE_BLOCKS: usize = DIRECT_SLOTS + INDIRECT_PER_BLOCK;

/// Persisted subset, exactly as it sits in the inode table.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    pub i_no: u32,
    pub i_size: u32,
    pub sectors: [u32; INODE_SLOTS],
}

/// In-memory inode.
#[repr(C)]
pub struct Inode {
    pub i_no: u32,
    /// File bytes, or the summed directory-entry bytes for a directory.
    pub i_size: u32,
    pub open_cnt: u32,
    /// A second writer is refused while this is set.
    pub write_deny: bool,
    pub sectors: [u32; INODE_SLOTS],
    /// Link in the owning partition's open-inodes list.
    pub tag: ListElem,
}

impl Inode {
    pub fn new(i_no: u32) -> Self {
        Self {
            i_no,
            i_size: 0,
            open_cnt: 0,
            write_deny: false,
            sectors: [0; INODE_SLOTS],
            tag: ListElem::new(),
        }
    }

    fn pack(&self) -> DiskInode {
        DiskInode { i_no: self.i_no, i_size: self.i_size, sectors: self.sectors }
    }

    fn unpack(&mut self, disk: &DiskInode) {
        self.i_no = disk.i_no;
        self.i_size = disk.i_size;
        self.sectors = disk.sectors;
    }
}

/// Where inode `i_no` lives in the table: sector, byte offset, and whether
/// the 60-byte record straddles into the next sector.
struct InodePosition {
    straddles: bool,
    sec_lba: u32,
    off_in_sector: usize,
}

fn locate(part: *mut Partition, i_no: u32) -> InodePosition {
    let sb = unsafe { &*(*part).sb };
    assert!(i_no < sb.inode_cnt);
    let off_bytes = i_no as usize * size_of::<DiskInode>();
    let off_sects = off_bytes / SECTOR_SIZE;
    let off_in_sector = off_bytes % SECTOR_SIZE;
    InodePosition {
        straddles: SECTOR_SIZE - off_in_sector < size_of::<DiskInode>(),
        sec_lba: sb.inode_table_lba + off_sects as u32,
        off_in_sector,
    }
}

/// Write the persisted subset of `inode` back into the table. `io_buf` must
/// hold two sectors for the straddling case.
pub fn sync(part: *mut Partition, inode: *mut Inode, io_buf: &mut [u8]) {
    unsafe {
        let pos = locate(part, (*inode).i_no);
        let disk_inode = (*inode).pack();
        let sec_cnt = if pos.straddles { 2 } else { 1 };
        assert!(io_buf.len() >= sec_cnt * SECTOR_SIZE);

        let hd = (*part).disk;
        ide::read(hd, pos.sec_lba, io_buf.as_mut_ptr(), sec_cnt);
        core::ptr::copy_nonoverlapping(
            &disk_inode as *const DiskInode as *const u8,
            io_buf.as_mut_ptr().add(pos.off_in_sector),
            size_of::<DiskInode>(),
        );
        ide::write(hd, pos.sec_lba, io_buf.as_ptr(), sec_cnt);
    }
}

/// Open inode `i_no`: bump it in the cache, or load it from the table.
pub fn open(part: *mut Partition, i_no: u32) -> *mut Inode {
    let open_inodes = unsafe { &mut (*part).open_inodes };

    for elem in open_inodes.iter() {
        let inode = elem2entry!(Inode, tag, elem);
        unsafe {
            if (*inode).i_no == i_no {
                (*inode).open_cnt += 1;
                return inode;
            }
        }
    }

    let pos = locate(part, i_no);
    let inode = Box::into_raw(Box::new(Inode::new(i_no)));
    unsafe {
        let sec_cnt = if pos.straddles { 2 } else { 1 };
        let mut io_buf = vec![0u8; sec_cnt * SECTOR_SIZE];
        ide::read((*part).disk, pos.sec_lba, io_buf.as_mut_ptr(), sec_cnt);
        let disk_inode =
            &*(io_buf.as_ptr().add(pos.off_in_sector) as *const DiskInode);
        (*inode).unpack(disk_inode);
        (*inode).open_cnt = 1;
        (*inode).write_deny = false;
        open_inodes.push_front(&mut (*inode).tag);
    }
    inode
}

/// Drop one reference; evict from the cache on the last close.
pub fn close(inode: *mut Inode) {
    let old = interrupts::disable();
    unsafe {
        (*inode).open_cnt -= 1;
        if (*inode).open_cnt == 0 {
            crate::list::List::remove(&mut (*inode).tag);
            drop(Box::from_raw(inode));
        }
    }
    interrupts::set_status(old);
}

/// Gather every data-block LBA of `inode` into `all_blocks`: 12 direct
/// slots, then the indirect table if present.
pub fn collect_all_blocks(
    part: *mut Partition,
    inode: *mut Inode,
    all_blocks: &mut [u32; MAX_FILE_BLOCKS],
) {
    unsafe {
        all_blocks[..DIRECT_SLOTS].copy_from_slice(&(&(*inode).sectors)[..DIRECT_SLOTS]);
        let indirect_lba = (*inode).sectors[DIRECT_SLOTS];
        if indirect_lba != 0 {
            ide::read(
                (*part).disk,
                indirect_lba,
                all_blocks[DIRECT_SLOTS..].as_mut_ptr() as *mut u8,
                1,
            );
        } else {
            all_blocks[DIRECT_SLOTS..].fill(0);
        }
    }
}

/// Free everything inode `i_no` owns: data blocks, the indirect table and
/// both bitmap bits. The caller has already ensured it is not open.
pub fn release(part: *mut Partition, i_no: u32) {
    let inode = open(part, i_no);
    unsafe {
        assert_eq!((*inode).i_no, i_no);

        let mut all_blocks = Box::new([0u32; MAX_FILE_BLOCKS]);
        collect_all_blocks(part, inode, &mut all_blocks);

        let sb = &*(*part).sb;
        for &lba in all_blocks.iter() {
            if lba != 0 {
                let bit = (lba - sb.data_start_lba) as usize;
                (*part).block_bitmap.set(bit, false);
                crate::fs::file::bitmap_sync(part, bit, crate::fs::file::BitmapType::Block);
            }
        }
        let indirect_lba = (*inode).sectors[DIRECT_SLOTS];
        if indirect_lba != 0 {
            let bit = (indirect_lba - sb.data_start_lba) as usize;
            (*part).block_bitmap.set(bit, false);
            crate::fs::file::bitmap_sync(part, bit, crate::fs::file::BitmapType::Block);
        }

        (*part).inode_bitmap.set(i_no as usize, false);
        crate::fs::file::bitmap_sync(part, i_no as usize, crate::fs::file::BitmapType::Inode);
    }
    close(inode);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_inode_is_60_bytes() {
        assert_eq!(size_of::<DiskInode>(), 60);
    }

    #[test]
    fn straddle_math() {
        // 512 / 60: inode 8 starts at byte 480 of sector 0 and runs into
        // sector 1.
        let off = 8 * size_of::<DiskInode>() % SECTOR_SIZE;
        assert_eq!(off, 480);
        assert!(SECTOR_SIZE - off < size_of::<DiskInode>());
        // Inode 0 does not straddle.
        assert!(SECTOR_SIZE - 0 >= size_of::<DiskInode>());
    }

    #[test]
    fn file_block_capacity() {
        assert_eq!(MAX_FILE_BLOCKS, 140);
        assert_eq!(INDIRECT_PER_BLOCK, 128);
    }
}
