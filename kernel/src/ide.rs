//! ATA (IDE) disk driver.
//!
//! LBA28 PIO with interrupt-driven completion. Each channel serializes its
//! two drives behind one lock and hands exactly one command to the hardware
//! at a time: the issuing task arms the channel's "interrupt expected" flag
//! and blocks on its completion semaphore; the IRQ handler clears the flag,
//! signals the semaphore and reads the status register to acknowledge.
//!
//! At boot the driver identifies every drive and walks the MBR (recursing
//! through extended partitions) to register partitions under canonical
//! `sd<letter><number>` names.
//!
//! Boot contract: the BIOS leaves the hard-disk count in the byte at
//! physical `0x475`, readable through the kernel alias.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::asm::{self, Port};
use crate::arch::trap::IntrFrame;
use crate::bitmap::Bitmap;
use crate::fs::superblock::SuperBlock;
use crate::interrupts::{self, IRQ_IDE0, IRQ_IDE1};
use crate::list::{List, ListElem};
use crate::sync::{Lock, Semaphore};
use crate::timer;

pub const SECTOR_SIZE: usize = 512;

/// 80 MiB addressing cap.
const MAX_LBA: u32 = 80 * 1024 * 1024 / SECTOR_SIZE as u32 - 1;

/// Bootloader/BIOS contract: hard-disk count byte.
const HD_CNT_VADDR: u32 = 0xc000_0475;

// Register offsets from the channel's base port.
const REG_DATA: u16 = 0;
const REG_SECT_CNT: u16 = 2;
const REG_LBA_L: u16 = 3;
const REG_LBA_M: u16 = 4;
const REG_LBA_H: u16 = 5;
const REG_DEV: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_CMD: u16 = 7;

// Status bits.
const BIT_STAT_BSY: u8 = 0x80;
const BIT_STAT_DRQ: u8 = 0x08;

// Device register bits.
const BIT_DEV_MBS: u8 = 0xa0;
const BIT_DEV_LBA: u8 = 0x40;
const BIT_DEV_SLAVE: u8 = 0x10;

// Commands.
const CMD_IDENTIFY: u8 = 0xec;
const CMD_READ_SECTOR: u8 = 0x20;
const CMD_WRITE_SECTOR: u8 = 0x30;

/// Extended-partition type byte in an MBR entry.
const PART_TYPE_EXTENDED: u8 = 0x05;

/// Hard bound on the DRQ poll: the ATA spec allows the device 30 seconds.
const BUSY_WAIT_MS: u32 = 30 * 1000;

pub const PRIM_PARTS_PER_DISK: usize = 4;
pub const LOGIC_PARTS_PER_DISK: usize = 8;

/// One partition, as registered on the global partition list.
#[repr(C)]
pub struct Partition {
    pub start_lba: u32,
    pub sec_cnt: u32,
    pub disk: *mut Disk,
    pub tag: ListElem,
    pub name: [u8; 8],
    /// Superblock, loaded (or created by format) at mount time.
    pub sb: *mut SuperBlock,
    pub block_bitmap: Bitmap,
    pub inode_bitmap: Bitmap,
    /// In-memory inodes with open_cnt > 0.
    pub open_inodes: List,
}

impl Partition {
    const fn new() -> Self {
        Self {
            start_lba: 0,
            sec_cnt: 0,
            disk: ptr::null_mut(),
            tag: ListElem::new(),
            name: [0; 8],
            sb: ptr::null_mut(),
            block_bitmap: Bitmap::empty(),
            inode_bitmap: Bitmap::empty(),
            open_inodes: List::new(),
        }
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }
}

/// One drive on a channel.
#[repr(C)]
pub struct Disk {
    pub name: [u8; 8],
    pub channel: *mut Channel,
    /// 0 master, 1 slave.
    pub dev_no: u8,
    pub prim_parts: [Partition; PRIM_PARTS_PER_DISK],
    pub logic_parts: [Partition; LOGIC_PARTS_PER_DISK],
}

impl Disk {
    const fn new() -> Self {
        Self {
            name: [0; 8],
            channel: ptr::null_mut(),
            dev_no: 0,
            prim_parts: [
                Partition::new(),
                Partition::new(),
                Partition::new(),
                Partition::new(),
            ],
            logic_parts: [
                Partition::new(),
                Partition::new(),
                Partition::new(),
                Partition::new(),
                Partition::new(),
                Partition::new(),
                Partition::new(),
                Partition::new(),
            ],
        }
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }
}

/// One ATA channel: two drives behind a lock and a completion handshake.
#[repr(C)]
pub struct Channel {
    pub name: [u8; 8],
    pub port_base: u16,
    pub irq_no: u8,
    pub lock: Lock,
    /// Armed by the command issuer right before writing the command
    /// register. Read by the IRQ handler without the lock: only the lock
    /// holder arms it, and the handler runs with interrupts masked on this
    /// single CPU.
    pub expecting_intr: AtomicBool,
    /// Signaled once per completed command.
    pub disk_done: Semaphore,
    pub devices: [Disk; 2],
}

impl Channel {
    const fn new() -> Self {
        Self {
            name: [0; 8],
            port_base: 0,
            irq_no: 0,
            lock: Lock::new(),
            expecting_intr: AtomicBool::new(false),
            disk_done: Semaphore::new(0),
            devices: [Disk::new(), Disk::new()],
        }
    }

    fn port(&self, offset: u16) -> Port<u8> {
        Port::new(self.port_base + offset)
    }
}

struct ChannelsCell(UnsafeCell<[Channel; 2]>);
unsafe impl Sync for ChannelsCell {}

static CHANNELS: ChannelsCell = ChannelsCell(UnsafeCell::new([Channel::new(), Channel::new()]));

struct ListCell(UnsafeCell<List>);
unsafe impl Sync for ListCell {}

/// Every partition found at boot, linked through `Partition::tag`.
static PARTITION_LIST: ListCell = ListCell(UnsafeCell::new(List::new()));

pub fn partition_list() -> &'static mut List {
    unsafe { &mut *PARTITION_LIST.0.get() }
}

fn channels() -> &'static mut [Channel; 2] {
    unsafe { &mut *CHANNELS.0.get() }
}

/// Find a registered partition by canonical name.
pub fn partition_by_name(name: &str) -> Option<*mut Partition> {
    partition_list()
        .iter()
        .map(|elem| crate::elem2entry!(Partition, tag, elem))
        .find(|&part| unsafe { (*part).name_str() } == name)
}

fn channel_of(hd: *mut Disk) -> &'static mut Channel {
    unsafe { &mut *(*hd).channel }
}

/// Select master or slave on the drive's channel.
fn select_disk(hd: *mut Disk) {
    let channel = channel_of(hd);
    let mut dev = BIT_DEV_MBS | BIT_DEV_LBA;
    if unsafe { (*hd).dev_no } == 1 {
        dev |= BIT_DEV_SLAVE;
    }
    unsafe { channel.port(REG_DEV).write(dev) };
}

/// Program sector count and the 28-bit LBA for the next command.
fn select_sector(hd: *mut Disk, lba: u32, sec_cnt: usize) {
    assert!(lba <= MAX_LBA);
    let channel = channel_of(hd);
    unsafe {
        // 0 means 256 sectors.
        channel.port(REG_SECT_CNT).write(sec_cnt as u8);
        channel.port(REG_LBA_L).write(lba as u8);
        channel.port(REG_LBA_M).write((lba >> 8) as u8);
        channel.port(REG_LBA_H).write((lba >> 16) as u8);
        let mut dev = BIT_DEV_MBS | BIT_DEV_LBA | ((lba >> 24) as u8 & 0x0f);
        if (*hd).dev_no == 1 {
            dev |= BIT_DEV_SLAVE;
        }
        channel.port(REG_DEV).write(dev);
    }
}

/// Arm the completion handshake and write the command register.
fn cmd_out(channel: &mut Channel, cmd: u8) {
    channel.expecting_intr.store(true, Ordering::Relaxed);
    unsafe { channel.port(REG_CMD).write(cmd) };
}

/// Poll until BSY clears, up to the 30 s the ATA spec allows. True when
/// the device is ready to transfer (DRQ).
fn busy_wait(hd: *mut Disk) -> bool {
    let channel = channel_of(hd);
    let mut time_left = BUSY_WAIT_MS;
    while time_left > 0 {
        let status = unsafe { channel.port(REG_STATUS).read() };
        if status & BIT_STAT_BSY == 0 {
            return status & BIT_STAT_DRQ != 0;
        }
        timer::mtime_sleep(10);
        time_left = time_left.saturating_sub(10);
    }
    false
}

fn read_from_sector(channel: &mut Channel, buf: *mut u8, sec_cnt: usize) {
    unsafe {
        asm::insw(
            channel.port_base + REG_DATA,
            buf as *mut u16,
            sec_cnt * SECTOR_SIZE / 2,
        );
    }
}

fn write_to_sector(channel: &mut Channel, buf: *const u8, sec_cnt: usize) {
    unsafe {
        asm::outsw(
            channel.port_base + REG_DATA,
            buf as *const u16,
            sec_cnt * SECTOR_SIZE / 2,
        );
    }
}

/// Read `sec_cnt` sectors starting at `lba` into `buf`.
///
/// # Safety
/// `buf` must cover `sec_cnt * SECTOR_SIZE` bytes and `hd` must be a live
/// drive registered on a channel.
pub unsafe fn read(hd: *mut Disk, lba: u32, buf: *mut u8, sec_cnt: usize) {
    assert!(sec_cnt > 0 && lba + sec_cnt as u32 - 1 <= MAX_LBA);
    let channel = channel_of(hd);
    channel.lock.acquire();
    select_disk(hd);

    let mut secs_done = 0usize;
    while secs_done < sec_cnt {
        let secs_op = (sec_cnt - secs_done).min(256);
        select_sector(hd, lba + secs_done as u32, secs_op);
        cmd_out(channel, CMD_READ_SECTOR);

        // The device raises its IRQ when the data is ready; sleep on the
        // channel until then.
        channel.disk_done.down();

        if !busy_wait(hd) {
            panic!("{}: read of lba {} timed out", (*hd).name_str(), lba);
        }
        read_from_sector(channel, buf.add(secs_done * SECTOR_SIZE), secs_op);
        secs_done += secs_op;
    }
    channel.lock.release();
}

/// Write `sec_cnt` sectors starting at `lba` from `buf`.
///
/// # Safety
/// As for [`read`].
pub unsafe fn write(hd: *mut Disk, lba: u32, buf: *const u8, sec_cnt: usize) {
    assert!(sec_cnt > 0 && lba + sec_cnt as u32 - 1 <= MAX_LBA);
    let channel = channel_of(hd);
    channel.lock.acquire();
    select_disk(hd);

    let mut secs_done = 0usize;
    while secs_done < sec_cnt {
        let secs_op = (sec_cnt - secs_done).min(256);
        select_sector(hd, lba + secs_done as u32, secs_op);
        cmd_out(channel, CMD_WRITE_SECTOR);

        if !busy_wait(hd) {
            panic!("{}: write of lba {} timed out", (*hd).name_str(), lba);
        }
        write_to_sector(channel, buf.add(secs_done * SECTOR_SIZE), secs_op);

        // Block until the device has drained the sector(s).
        channel.disk_done.down();
        secs_done += secs_op;
    }
    channel.lock.release();
}

/// Channel IRQ: complete the handshake if a command was outstanding.
fn intr_hd_handler(vec: u8, _frame: &mut IntrFrame) {
    assert!(vec == IRQ_IDE0 || vec == IRQ_IDE1);
    let ch_no = (vec - IRQ_IDE0) as usize;
    let channel = &mut channels()[ch_no];
    if channel.expecting_intr.swap(false, Ordering::Relaxed) {
        channel.disk_done.up();
        // Reading the status register lets the device drop the IRQ line.
        unsafe {
            let _ = channel.port(REG_STATUS).read();
        }
    }
}

/// Swap the byte pairs of an ATA identify string into readable order.
fn swap_pairs_and_trim(src: &[u8], dst: &mut [u8]) -> usize {
    let mut len = 0;
    for pair in src.chunks_exact(2) {
        dst[len] = pair[1];
        dst[len + 1] = pair[0];
        len += 2;
    }
    while len > 0 && (dst[len - 1] == b' ' || dst[len - 1] == 0) {
        len -= 1;
    }
    len
}

/// IDENTIFY DEVICE: log model, serial and capacity.
fn identify(hd: *mut Disk) {
    let channel = channel_of(hd);
    let mut info = [0u8; SECTOR_SIZE];

    select_disk(hd);
    cmd_out(channel, CMD_IDENTIFY);
    channel.disk_done.down();

    if !busy_wait(hd) {
        panic!("{}: identify timed out", unsafe { (*hd).name_str() });
    }
    read_from_sector(channel, info.as_mut_ptr(), 1);

    let mut serial = [0u8; 20];
    let serial_len = swap_pairs_and_trim(&info[10 * 2..20 * 2], &mut serial);
    let mut model = [0u8; 40];
    let model_len = swap_pairs_and_trim(&info[27 * 2..47 * 2], &mut model);
    let sectors = u32::from_le_bytes([info[60 * 2], info[60 * 2 + 1], info[61 * 2], info[61 * 2 + 1]]);

    crate::log!(
        "[IDE] {}: model '{}' serial '{}' {} sectors ({} MiB)",
        unsafe { (*hd).name_str() },
        core::str::from_utf8(&model[..model_len]).unwrap_or("?"),
        core::str::from_utf8(&serial[..serial_len]).unwrap_or("?"),
        sectors,
        sectors / 2048
    );
}

/// One parsed MBR partition-table entry.
#[derive(Clone, Copy, PartialEq, Debug)]
struct PartTableEntry {
    fs_type: u8,
    start_lba: u32,
    sec_cnt: u32,
}

/// Pull the four table entries and the signature out of a boot sector.
fn parse_boot_sector(sector: &[u8; SECTOR_SIZE]) -> ([PartTableEntry; 4], u16) {
    let mut entries = [PartTableEntry { fs_type: 0, start_lba: 0, sec_cnt: 0 }; 4];
    for (idx, entry) in entries.iter_mut().enumerate() {
        let off = 446 + idx * 16;
        entry.fs_type = sector[off + 4];
        entry.start_lba =
            u32::from_le_bytes([sector[off + 8], sector[off + 9], sector[off + 10], sector[off + 11]]);
        entry.sec_cnt =
            u32::from_le_bytes([sector[off + 12], sector[off + 13], sector[off + 14], sector[off + 15]]);
    }
    let signature = u16::from_le_bytes([sector[510], sector[511]]);
    (entries, signature)
}

struct ScanState {
    /// LBA of the outermost extended partition; logical start addresses are
    /// relative to it.
    ext_lba_base: u32,
    prim_no: usize,
    logic_no: usize,
}

fn register_partition(part: *mut Partition, hd: *mut Disk, start_lba: u32, sec_cnt: u32, number: usize) {
    unsafe {
        (*part).start_lba = start_lba;
        (*part).sec_cnt = sec_cnt;
        (*part).disk = hd;

        let disk_name = (*hd).name_str();
        let mut name = [0u8; 8];
        let bytes = disk_name.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        assert!(number < 10);
        name[bytes.len()] = b'0' + number as u8;
        (*part).name = name;

        partition_list().push_back(&mut (*part).tag);
        crate::log!(
            "[IDE]   {} lba {:#x} + {} sectors",
            (*part).name_str(),
            start_lba,
            sec_cnt
        );
    }
}

/// Walk the partition table at `ext_lba`, recursing through extended
/// partitions. Primaries number 1–4, logicals from 5.
fn partition_scan(hd: *mut Disk, ext_lba: u32, state: &mut ScanState) {
    let mut bs = Box::new([0u8; SECTOR_SIZE]);
    unsafe { read(hd, ext_lba, bs.as_mut_ptr(), 1) };
    let (entries, signature) = parse_boot_sector(&bs);
    if signature != 0xaa55 {
        crate::log_warn!("[IDE] {}: bad MBR signature at lba {}", unsafe { (*hd).name_str() }, ext_lba);
        return;
    }

    for entry in entries.iter() {
        if entry.fs_type == PART_TYPE_EXTENDED {
            if state.ext_lba_base != 0 {
                // Nested extended: start is relative to the outer base.
                partition_scan(hd, entry.start_lba + state.ext_lba_base, state);
            } else {
                state.ext_lba_base = entry.start_lba;
                partition_scan(hd, entry.start_lba, state);
            }
        } else if entry.fs_type != 0 {
            if ext_lba == 0 {
                assert!(state.prim_no < PRIM_PARTS_PER_DISK);
                let part = unsafe { &mut (*hd).prim_parts[state.prim_no] as *mut Partition };
                register_partition(part, hd, ext_lba + entry.start_lba, entry.sec_cnt, state.prim_no + 1);
                state.prim_no += 1;
            } else {
                if state.logic_no >= LOGIC_PARTS_PER_DISK {
                    return;
                }
                let part = unsafe { &mut (*hd).logic_parts[state.logic_no] as *mut Partition };
                register_partition(part, hd, ext_lba + entry.start_lba, entry.sec_cnt, state.logic_no + 5);
                state.logic_no += 1;
            }
        }
    }
}

/// Probe channels and drives, identify everything, scan data disks for
/// partitions.
pub fn init() {
    let hd_cnt = unsafe { *(HD_CNT_VADDR as *const u8) } as usize;
    assert!(hd_cnt > 0);
    let channel_cnt = crate::memory::div_round_up(hd_cnt, 2);
    partition_list().init();

    for (ch_no, channel) in channels().iter_mut().enumerate().take(channel_cnt) {
        let (port_base, irq_no, name): (u16, u8, &str) = match ch_no {
            0 => (0x1f0, IRQ_IDE0, "ide0"),
            _ => (0x170, IRQ_IDE1, "ide1"),
        };
        channel.port_base = port_base;
        channel.irq_no = irq_no;
        channel.name[..name.len()].copy_from_slice(name.as_bytes());
        channel.lock.init();
        channel.disk_done.init();
        interrupts::register_handler(irq_no, intr_hd_handler);

        for dev_no in 0..2 {
            let disk_index = ch_no * 2 + dev_no;
            if disk_index >= hd_cnt {
                break;
            }
            let channel_ptr = channel as *mut Channel;
            let hd = &mut channel.devices[dev_no] as *mut Disk;
            unsafe {
                (*hd).channel = channel_ptr;
                (*hd).dev_no = dev_no as u8;
                let name = [b's', b'd', b'a' + disk_index as u8, 0, 0, 0, 0, 0];
                (*hd).name = name;
            }
            identify(hd);
            // Device 0 carries the raw kernel image, not a partition table.
            if disk_index != 0 {
                let mut state = ScanState { ext_lba_base: 0, prim_no: 0, logic_no: 0 };
                partition_scan(hd, 0, &mut state);
            }
        }
    }
    crate::log!("[IDE] {} channel(s), {} disk(s), {} partition(s)",
        channel_cnt, hd_cnt, partition_list().len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mbr() -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        // Entry 0: type 0x83 at lba 2048, 163840 sectors.
        let e0 = 446;
        sector[e0 + 4] = 0x83;
        sector[e0 + 8..e0 + 12].copy_from_slice(&2048u32.to_le_bytes());
        sector[e0 + 12..e0 + 16].copy_from_slice(&163840u32.to_le_bytes());
        // Entry 1: extended at lba 165888.
        let e1 = 446 + 16;
        sector[e1 + 4] = PART_TYPE_EXTENDED;
        sector[e1 + 8..e1 + 12].copy_from_slice(&165888u32.to_le_bytes());
        sector[e1 + 12..e1 + 16].copy_from_slice(&32768u32.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xaa;
        sector
    }

    #[test]
    fn boot_sector_parse() {
        let (entries, signature) = parse_boot_sector(&sample_mbr());
        assert_eq!(signature, 0xaa55);
        assert_eq!(entries[0].fs_type, 0x83);
        assert_eq!(entries[0].start_lba, 2048);
        assert_eq!(entries[0].sec_cnt, 163840);
        assert_eq!(entries[1].fs_type, PART_TYPE_EXTENDED);
        assert_eq!(entries[2].fs_type, 0);
    }

    #[test]
    fn identify_strings_unswap() {
        // "eGenir c" pairs swap back to "Generic ".
        let raw = *b"eGenir c";
        let mut out = [0u8; 8];
        let len = swap_pairs_and_trim(&raw, &mut out);
        assert_eq!(&out[..len], b"Generic");
    }

    #[test]
    fn lba_cap_is_80_mib() {
        assert_eq!(MAX_LBA, 163839);
    }
}
