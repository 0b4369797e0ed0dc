// Character/block device layer: a small table of open devices addressed by
// a dev-id handle, dispatching on the device major. The `BlockDev` trait is
// the seam the FAT16 code reads sectors through.

use crate::constants::*;
use crate::{console, ide};
use spin::Mutex;

const DEV_TABLE_SIZE: usize = 16;

/// Sector-addressed device. `read`/`write` return the number of sectors
/// completed, which may be short when the device reports an error.
pub(crate) trait BlockDev {
    fn read(&mut self, sector: u32, buf: &mut [u8], count: u32) -> i32;
    fn write(&mut self, sector: u32, buf: &[u8], count: u32) -> i32;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DevData {
    Tty,
    Disk { disk: usize, part: usize },
}

#[derive(Clone, Copy)]
struct Device {
    major: u32,
    minor: u32,
    open_count: u32,
    data: DevData,
}

struct DevTable {
    devices: [Option<Device>; DEV_TABLE_SIZE],
}

static DEV_TABLE: Mutex<DevTable> = Mutex::new(DevTable {
    devices: [None; DEV_TABLE_SIZE],
});

/// Open (or re-open) the device `major:minor`; returns a dev-id handle.
pub(crate) fn dev_open(major: u32, minor: u32) -> Option<i32> {
    let mut table = DEV_TABLE.lock();

    for (i, slot) in table.devices.iter_mut().enumerate() {
        if let Some(dev) = slot {
            if dev.major == major && dev.minor == minor {
                dev.open_count += 1;
                return Some(i as i32);
            }
        }
    }

    let data = match major {
        DEV_TTY => Some(DevData::Tty),
        DEV_DISK => ide::disk_open(minor).map(|(disk, part)| DevData::Disk { disk, part }),
        _ => {
            println!("unknown device major: {}", major);
            None
        }
    }?;

    for (i, slot) in table.devices.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(Device {
                major,
                minor,
                open_count: 1,
                data,
            });
            return Some(i as i32);
        }
    }

    println!("device table full");
    None
}

pub(crate) fn dev_close(dev_id: i32) {
    let mut table = DEV_TABLE.lock();
    if let Some(slot) = table.devices.get_mut(dev_id as usize) {
        if let Some(dev) = slot {
            dev.open_count -= 1;
            if dev.open_count == 0 {
                *slot = None;
            }
        }
    }
}

fn dev_data(dev_id: i32) -> Option<DevData> {
    let table = DEV_TABLE.lock();
    table
        .devices
        .get(dev_id as usize)
        .and_then(|slot| slot.as_ref())
        .map(|dev| dev.data)
}

/// Read from a device. `addr` is a sector for disks and ignored for ttys;
/// `size` counts sectors for disks and bytes for ttys.
pub(crate) fn dev_read(dev_id: i32, addr: u32, buf: &mut [u8], size: u32) -> i32 {
    match dev_data(dev_id) {
        Some(DevData::Disk { disk, part }) => ide::disk_read(disk, part, addr, buf, size),
        // Console input is not wired up; a tty read sees end-of-input.
        Some(DevData::Tty) => 0,
        None => {
            println!("read on bad dev id: {}", dev_id);
            -1
        }
    }
}

pub(crate) fn dev_write(dev_id: i32, addr: u32, buf: &[u8], size: u32) -> i32 {
    match dev_data(dev_id) {
        Some(DevData::Disk { disk, part }) => ide::disk_write(disk, part, addr, buf, size),
        Some(DevData::Tty) => {
            let n = core::cmp::min(size as usize, buf.len());
            console::write_bytes(&buf[..n]) as i32
        }
        None => {
            println!("write on bad dev id: {}", dev_id);
            -1
        }
    }
}

pub(crate) fn dev_control(dev_id: i32, _cmd: i32, _arg0: u32, _arg1: u32) -> i32 {
    match dev_data(dev_id) {
        // Neither device implements any control command yet.
        Some(_) => -1,
        None => -1,
    }
}

/// BlockDev view of an open disk device, as handed to the FAT16 code.
pub(crate) struct DevBlock(pub(crate) i32);

impl BlockDev for DevBlock {
    fn read(&mut self, sector: u32, buf: &mut [u8], count: u32) -> i32 {
        dev_read(self.0, sector, buf, count)
    }

    fn write(&mut self, sector: u32, buf: &[u8], count: u32) -> i32 {
        dev_write(self.0, sector, buf, count)
    }
}
