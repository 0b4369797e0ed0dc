// FAT16 over a block device. Short (8.3) names only, root directory only.
//
// All sector traffic for metadata goes through one page-sized scratch
// buffer; `curr_sector` names the sector it caches (or -1). Whole-cluster
// data transfers bypass the scratch and go straight between the device and
// the caller's buffer; partial transfers are read-modify-write through it,
// invalidating the cache first.

use crate::constants::*;
use crate::dev::BlockDev;
use crate::file::{File, FileKind, O_ACCMODE, O_CREAT, O_RDONLY, O_TRUNC};
use crate::fs::{Dir, Dirent, FsError};
use crate::util;
use alloc::boxed::Box;
use bitflags::bitflags;

pub(crate) type Cluster = u16;

/// First end-of-chain marker; anything >= this terminates a chain.
pub(crate) const FAT_CLUSTER_INVALID: u32 = 0xfff8;
pub(crate) const FAT_CLUSTER_FREE: u32 = 0;

pub(crate) const DIRITEM_NAME_END: u8 = 0x00;
pub(crate) const DIRITEM_NAME_FREE: u8 = 0xe5;

const FAT_BUF_SIZE: usize = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DirAttr: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

const ATTR_LONG_NAME: u8 = 0x0f;

pub(crate) fn cluster_is_valid(cluster: u32) -> bool {
    cluster >= 2 && cluster < FAT_CLUSTER_INVALID
}

/// One 32-byte root directory entry as stored on disk.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct DirItem {
    pub(crate) name: [u8; 11],
    pub(crate) attr: u8,
    pub(crate) nt_res: u8,
    pub(crate) crt_time_tenth: u8,
    pub(crate) crt_time: u16,
    pub(crate) crt_date: u16,
    pub(crate) lst_acc_date: u16,
    pub(crate) fst_clus_hi: u16,
    pub(crate) wrt_time: u16,
    pub(crate) wrt_date: u16,
    pub(crate) fst_clus_lo: u16,
    pub(crate) file_size: u32,
}

impl DirItem {
    fn init(attr: u8, name: &[u8]) -> DirItem {
        let mut sfn = [0u8; 11];
        to_sfn(&mut sfn, name);
        DirItem {
            name: sfn,
            attr,
            nt_res: 0,
            crt_time_tenth: 0,
            crt_time: 0,
            crt_date: 0,
            lst_acc_date: 0,
            fst_clus_hi: (FAT_CLUSTER_INVALID >> 16) as u16,
            wrt_time: 0,
            wrt_date: 0,
            fst_clus_lo: (FAT_CLUSTER_INVALID & 0xffff) as u16,
            file_size: 0,
        }
    }

    fn start_cluster(&self) -> u32 {
        ((self.fst_clus_hi as u32) << 16) | self.fst_clus_lo as u32
    }
}

/// The DOS boot record at sector 0 (BPB fields only as far as we read them).
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct Dbr {
    jmp_boot: [u8; 3],
    oem_name: [u8; 8],
    bytes_per_sec: u16,
    sec_per_clus: u8,
    rsvd_sec_cnt: u16,
    num_fats: u8,
    root_ent_cnt: u16,
    tot_sec16: u16,
    media: u8,
    fat_sz16: u16,
    sec_per_trk: u16,
    num_heads: u16,
    hidd_sec: u32,
    tot_sec32: u32,
    drv_num: u8,
    reserved1: u8,
    boot_sig: u8,
    vol_id: u32,
    vol_lab: [u8; 11],
    fil_sys_type: [u8; 8],
}

/// File kind encoded in a directory entry's attribute byte. Volume labels,
/// hidden/system entries and long-name continuation entries are opaque.
pub(crate) fn diritem_get_type(item: &DirItem) -> FileKind {
    if item.attr & (DirAttr::VOLUME_ID | DirAttr::HIDDEN | DirAttr::SYSTEM).bits() != 0 {
        return FileKind::Unknown;
    }
    if item.attr & ATTR_LONG_NAME == ATTR_LONG_NAME {
        return FileKind::Unknown;
    }
    if item.attr & DirAttr::DIRECTORY.bits() != 0 {
        FileKind::Dir
    } else {
        FileKind::Normal
    }
}

/// Space-pad and uppercase `src` into an 11-byte DIR_Name; '.' jumps the
/// cursor to the extension field.
pub(crate) fn to_sfn(dest: &mut [u8; 11], src: &[u8]) {
    dest.fill(b' ');
    let mut curr = 0;
    for &c in src {
        if curr >= 11 {
            break;
        }
        match c {
            0 => break,
            b'.' => curr = 8,
            _ => {
                dest[curr] = c.to_ascii_uppercase();
                curr += 1;
            }
        }
    }
}

fn diritem_name_match(item: &DirItem, path: &[u8]) -> bool {
    let mut sfn = [0u8; 11];
    to_sfn(&mut sfn, path);
    item.name == sfn
}

/// The inverse of to_sfn: "HELLO   TXT" → "HELLO.TXT". `dest` gets at most
/// 12 meaningful bytes and is NUL padded.
pub(crate) fn diritem_get_name(item: &DirItem, dest: &mut [u8]) {
    dest[..12].fill(0);
    let mut pos = 0;
    let mut ext: Option<usize> = None;
    for i in 0..11 {
        if item.name[i] != b' ' {
            dest[pos] = item.name[i];
            pos += 1;
        }
        if i == 7 {
            ext = Some(pos);
            dest[pos] = b'.';
            pos += 1;
        }
    }
    if let Some(dot) = ext {
        if dest[dot + 1] == 0 {
            dest[dot] = 0;
        }
    }
}

/// An in-memory FAT16 volume descriptor plus its scratch sector buffer.
pub(crate) struct Fat {
    pub(crate) tbl_start: u32,
    pub(crate) tbl_cnt: u32,
    pub(crate) tbl_sectors: u32,
    pub(crate) bytes_per_sec: u32,
    pub(crate) sec_per_cluster: u32,
    pub(crate) root_start: u32,
    pub(crate) root_ent_cnt: u32,
    pub(crate) data_start: u32,
    pub(crate) cluster_byte_size: u32,
    buf: Box<[u8; FAT_BUF_SIZE]>,
    curr_sector: i32,
}

impl Fat {
    /// Read the DBR and derive the volume layout.
    pub(crate) fn mount(dev: &mut dyn BlockDev) -> Result<Fat, FsError> {
        let mut buf = Box::new([0u8; FAT_BUF_SIZE]);
        if dev.read(0, &mut buf[..SECTOR_SIZE], 1) != 1 {
            println!("read dbr failed");
            return Err(FsError::DeviceError);
        }

        let dbr = unsafe { &*(buf.as_ptr() as *const Dbr) };
        let bytes_per_sec = dbr.bytes_per_sec as u32;
        let sec_per_cluster = dbr.sec_per_clus as u32;
        if bytes_per_sec == 0 || sec_per_cluster == 0 {
            println!("bad dbr");
            return Err(FsError::BadVolume);
        }
        let cluster_byte_size = sec_per_cluster * bytes_per_sec;
        if cluster_byte_size as usize > FAT_BUF_SIZE {
            println!("cluster too large: {}", cluster_byte_size);
            return Err(FsError::BadVolume);
        }

        let tbl_start = dbr.rsvd_sec_cnt as u32;
        let tbl_sectors = dbr.fat_sz16 as u32;
        let tbl_cnt = dbr.num_fats as u32;
        let root_ent_cnt = dbr.root_ent_cnt as u32;
        let root_start = tbl_start + tbl_sectors * tbl_cnt;
        let data_start = root_start + root_ent_cnt * 32 / bytes_per_sec;

        Ok(Fat {
            tbl_start,
            tbl_cnt,
            tbl_sectors,
            bytes_per_sec,
            sec_per_cluster,
            root_start,
            root_ent_cnt,
            data_start,
            cluster_byte_size,
            buf,
            curr_sector: -1,
        })
    }

    fn bread_sector(&mut self, dev: &mut dyn BlockDev, sector: u32) -> Result<(), FsError> {
        if sector as i32 == self.curr_sector {
            return Ok(());
        }
        let bps = self.bytes_per_sec as usize;
        if dev.read(sector, &mut self.buf[..bps], 1) != 1 {
            return Err(FsError::DeviceError);
        }
        self.curr_sector = sector as i32;
        Ok(())
    }

    fn bwrite_sector(&mut self, dev: &mut dyn BlockDev, sector: u32) -> Result<(), FsError> {
        let bps = self.bytes_per_sec as usize;
        if dev.write(sector, &self.buf[..bps], 1) != 1 {
            return Err(FsError::DeviceError);
        }
        Ok(())
    }

    /// Successor of `curr` in the allocation table.
    pub(crate) fn cluster_get_next(&mut self, dev: &mut dyn BlockDev, curr: u32) -> u32 {
        if !cluster_is_valid(curr) {
            return FAT_CLUSTER_INVALID;
        }

        let offset = curr * core::mem::size_of::<Cluster>() as u32;
        let sector = offset / self.bytes_per_sec;
        let off_sector = (offset % self.bytes_per_sec) as usize;
        if sector >= self.tbl_sectors {
            println!("cluster too big: {}", curr);
            return FAT_CLUSTER_INVALID;
        }

        if self.bread_sector(dev, self.tbl_start + sector).is_err() {
            return FAT_CLUSTER_INVALID;
        }
        u16::from_le_bytes([self.buf[off_sector], self.buf[off_sector + 1]]) as u32
    }

    /// Point `curr` at `next`, mirroring the write to every FAT copy.
    pub(crate) fn cluster_set_next(
        &mut self,
        dev: &mut dyn BlockDev,
        curr: u32,
        next: u32,
    ) -> Result<(), FsError> {
        if !cluster_is_valid(curr) {
            return Err(FsError::BadCluster);
        }

        let offset = curr * core::mem::size_of::<Cluster>() as u32;
        let mut sector = offset / self.bytes_per_sec;
        let off_sector = (offset % self.bytes_per_sec) as usize;
        if sector >= self.tbl_sectors {
            println!("cluster too big: {}", curr);
            return Err(FsError::BadCluster);
        }

        self.bread_sector(dev, self.tbl_start + sector)?;
        self.buf[off_sector..off_sector + 2].copy_from_slice(&(next as u16).to_le_bytes());

        for _ in 0..self.tbl_cnt {
            if self.bwrite_sector(dev, self.tbl_start + sector).is_err() {
                println!("write cluster failed");
                return Err(FsError::DeviceError);
            }
            sector += self.tbl_sectors;
        }
        Ok(())
    }

    pub(crate) fn cluster_free_chain(&mut self, dev: &mut dyn BlockDev, start: u32) {
        let mut curr = start;
        while cluster_is_valid(curr) {
            let next = self.cluster_get_next(dev, curr);
            let _ = self.cluster_set_next(dev, curr, FAT_CLUSTER_FREE);
            curr = next;
        }
    }

    /// Allocate a linked chain of `cnt` clusters, first-fit from cluster 2.
    /// The whole chain is rolled back if any link fails.
    pub(crate) fn cluster_alloc_free(
        &mut self,
        dev: &mut dyn BlockDev,
        mut cnt: u32,
    ) -> Result<u32, FsError> {
        let c_total = self.tbl_sectors * self.bytes_per_sec / core::mem::size_of::<Cluster>() as u32;

        let mut pre = FAT_CLUSTER_INVALID;
        let mut start = FAT_CLUSTER_INVALID;
        let mut curr = 2;
        while curr < c_total && cnt > 0 {
            let entry = self.cluster_get_next(dev, curr);
            if entry == FAT_CLUSTER_FREE {
                if !cluster_is_valid(start) {
                    start = curr;
                }
                if cluster_is_valid(pre) {
                    if self.cluster_set_next(dev, pre, curr).is_err() {
                        self.cluster_free_chain(dev, start);
                        return Err(FsError::NoSpace);
                    }
                }
                pre = curr;
                cnt -= 1;
            }
            curr += 1;
        }

        if cnt == 0 && self.cluster_set_next(dev, pre, FAT_CLUSTER_INVALID).is_ok() {
            return Ok(start);
        }

        self.cluster_free_chain(dev, start);
        println!("no free cluster");
        Err(FsError::NoSpace)
    }

    fn read_dir_entry(&mut self, dev: &mut dyn BlockDev, index: i32) -> Option<DirItem> {
        if index < 0 || index as u32 >= self.root_ent_cnt {
            return None;
        }

        let offset = index as u32 * core::mem::size_of::<DirItem>() as u32;
        let sector = self.root_start + offset / self.bytes_per_sec;
        self.bread_sector(dev, sector).ok()?;

        let off = (offset % self.bytes_per_sec) as usize;
        Some(unsafe { *(self.buf.as_ptr().add(off) as *const DirItem) })
    }

    fn write_dir_entry(
        &mut self,
        dev: &mut dyn BlockDev,
        item: &DirItem,
        index: i32,
    ) -> Result<(), FsError> {
        if index < 0 || index as u32 >= self.root_ent_cnt {
            return Err(FsError::BadVolume);
        }

        let offset = index as u32 * core::mem::size_of::<DirItem>() as u32;
        let sector = self.root_start + offset / self.bytes_per_sec;
        self.bread_sector(dev, sector)?;

        let off = (offset % self.bytes_per_sec) as usize;
        unsafe {
            core::ptr::copy_nonoverlapping(
                item as *const DirItem as *const u8,
                self.buf.as_mut_ptr().add(off),
                core::mem::size_of::<DirItem>(),
            );
        }
        self.bwrite_sector(dev, sector)
    }

    fn read_from_diritem(&self, file: &mut File, item: &DirItem, index: i32) {
        file.kind = diritem_get_type(item);
        file.size = item.file_size;
        file.pos = 0;
        file.sblk = item.start_cluster();
        file.cblk = file.sblk;
        file.p_index = index;
    }

    /// Root directory lookup. FREE slots (and the END slot) are remembered
    /// so O_CREAT can claim one.
    pub(crate) fn open(
        &mut self,
        dev: &mut dyn BlockDev,
        path: &[u8],
        file: &mut File,
    ) -> Result<(), FsError> {
        let mut p_index: i32 = -1;
        let mut file_item: Option<DirItem> = None;

        for i in 0..self.root_ent_cnt as i32 {
            let item = self.read_dir_entry(dev, i).ok_or(FsError::DeviceError)?;

            if item.name[0] == DIRITEM_NAME_END {
                p_index = i;
                break;
            }
            if item.name[0] == DIRITEM_NAME_FREE {
                p_index = i;
                continue;
            }
            if diritem_name_match(&item, path) {
                file_item = Some(item);
                p_index = i;
                break;
            }
        }

        if let Some(item) = file_item {
            self.read_from_diritem(file, &item, p_index);
            if file.mode & O_TRUNC != 0 {
                let sblk = file.sblk;
                self.cluster_free_chain(dev, sblk);
                file.sblk = FAT_CLUSTER_INVALID;
                file.cblk = FAT_CLUSTER_INVALID;
                file.size = 0;
            }
            return Ok(());
        }

        if file.mode & O_CREAT != 0 && p_index >= 0 {
            let item = DirItem::init(0, path);
            self.write_dir_entry(dev, &item, p_index).map_err(|err| {
                println!("create file failed");
                err
            })?;
            self.read_from_diritem(file, &item, p_index);
            return Ok(());
        }

        Err(FsError::NotFound)
    }

    /// Grow the cluster chain so `inc_bytes` more bytes fit past EOF.
    fn expand_file(
        &mut self,
        dev: &mut dyn BlockDev,
        file: &mut File,
        inc_bytes: u32,
    ) -> Result<(), FsError> {
        let cbs = self.cluster_byte_size;

        let cluster_cnt = if file.size == 0 || file.size % cbs == 0 {
            util::up2(inc_bytes, cbs) / cbs
        } else {
            // Room left in the last cluster may already cover the growth.
            let cfree = cbs - file.size % cbs;
            if cfree > inc_bytes {
                return Ok(());
            }
            let cnt = util::up2(inc_bytes - cfree, cbs) / cbs;
            if cnt == 0 {
                1
            } else {
                cnt
            }
        };

        let start = self.cluster_alloc_free(dev, cluster_cnt)?;

        if !cluster_is_valid(file.sblk) {
            file.sblk = start;
            file.cblk = start;
        } else {
            // Link at the chain tail. cblk may sit past the end after a
            // write that stopped exactly on a cluster boundary.
            let mut tail = if cluster_is_valid(file.cblk) {
                file.cblk
            } else {
                file.sblk
            };
            loop {
                let next = self.cluster_get_next(dev, tail);
                if !cluster_is_valid(next) {
                    break;
                }
                tail = next;
            }
            self.cluster_set_next(dev, tail, start)?;
            if !cluster_is_valid(file.cblk) {
                file.cblk = start;
            }
        }
        Ok(())
    }

    /// Advance `pos` by `move_bytes`, chasing (and optionally extending) the
    /// chain on a cluster boundary crossing.
    fn move_file_pos(
        &mut self,
        dev: &mut dyn BlockDev,
        file: &mut File,
        move_bytes: u32,
        expand: bool,
    ) -> Result<(), FsError> {
        let c_offset = file.pos % self.cluster_byte_size;

        if c_offset + move_bytes >= self.cluster_byte_size {
            let mut next = self.cluster_get_next(dev, file.cblk);
            if !cluster_is_valid(next) && expand {
                self.expand_file(dev, file, self.cluster_byte_size)?;
                next = self.cluster_get_next(dev, file.cblk);
            }
            file.cblk = next;
        }

        file.pos += move_bytes;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the file position; never reads past
    /// `size`. Returns the byte count transferred.
    pub(crate) fn read(&mut self, dev: &mut dyn BlockDev, file: &mut File, buf: &mut [u8]) -> u32 {
        let mut nbytes = buf.len() as u32;
        if file.pos + nbytes > file.size {
            nbytes = file.size.saturating_sub(file.pos);
        }

        let mut total = 0u32;
        while nbytes > 0 {
            if !cluster_is_valid(file.cblk) {
                break;
            }
            let mut curr = nbytes;
            let cluster_offset = file.pos % self.cluster_byte_size;
            let start_sector = self.data_start + (file.cblk - 2) * self.sec_per_cluster;

            if cluster_offset == 0 && nbytes == self.cluster_byte_size {
                let dst = &mut buf[total as usize..(total + self.cluster_byte_size) as usize];
                if dev.read(start_sector, dst, self.sec_per_cluster) != self.sec_per_cluster as i32 {
                    return total;
                }
                curr = self.cluster_byte_size;
            } else {
                if cluster_offset + curr > self.cluster_byte_size {
                    curr = self.cluster_byte_size - cluster_offset;
                }

                self.curr_sector = -1;
                let cbs = self.cluster_byte_size as usize;
                if dev.read(start_sector, &mut self.buf[..cbs], self.sec_per_cluster)
                    != self.sec_per_cluster as i32
                {
                    return total;
                }
                buf[total as usize..(total + curr) as usize].copy_from_slice(
                    &self.buf[cluster_offset as usize..(cluster_offset + curr) as usize],
                );
            }

            nbytes -= curr;
            total += curr;
            if self.move_file_pos(dev, file, curr, false).is_err() {
                return total;
            }
        }
        total
    }

    /// Write `buf` at the file position, extending the chain first when the
    /// write reaches past EOF. Returns the byte count transferred.
    pub(crate) fn write(&mut self, dev: &mut dyn BlockDev, file: &mut File, buf: &[u8]) -> u32 {
        let size = buf.len() as u32;

        if file.pos + size > file.size {
            let inc = file.pos + size - file.size;
            if self.expand_file(dev, file, inc).is_err() {
                println!("no cluster for file write");
                return 0;
            }
        }

        let mut nbytes = size;
        let mut total = 0u32;
        while nbytes > 0 {
            if !cluster_is_valid(file.cblk) {
                break;
            }
            let mut curr = nbytes;
            let cluster_offset = file.pos % self.cluster_byte_size;
            let start_sector = self.data_start + (file.cblk - 2) * self.sec_per_cluster;

            if cluster_offset == 0 && nbytes == self.cluster_byte_size {
                let src = &buf[total as usize..(total + self.cluster_byte_size) as usize];
                if dev.write(start_sector, src, self.sec_per_cluster) != self.sec_per_cluster as i32 {
                    return total;
                }
                curr = self.cluster_byte_size;
            } else {
                if cluster_offset + curr > self.cluster_byte_size {
                    curr = self.cluster_byte_size - cluster_offset;
                }

                // Read-modify-write of the whole cluster through the scratch.
                self.curr_sector = -1;
                let cbs = self.cluster_byte_size as usize;
                if dev.read(start_sector, &mut self.buf[..cbs], self.sec_per_cluster)
                    != self.sec_per_cluster as i32
                {
                    return total;
                }
                self.buf[cluster_offset as usize..(cluster_offset + curr) as usize]
                    .copy_from_slice(&buf[total as usize..(total + curr) as usize]);
                if dev.write(start_sector, &self.buf[..cbs], self.sec_per_cluster)
                    != self.sec_per_cluster as i32
                {
                    return total;
                }
            }

            nbytes -= curr;
            total += curr;
            file.size += curr;
            // Only extend when more data is coming; a write ending exactly
            // on a boundary must not leave a cluster past EOF.
            if self.move_file_pos(dev, file, curr, nbytes > 0).is_err() {
                return total;
            }
        }
        total
    }

    /// Write size and start cluster back into the directory entry. Read-only
    /// opens leave the entry untouched.
    pub(crate) fn close(&mut self, dev: &mut dyn BlockDev, file: &File) {
        if file.mode & O_ACCMODE == O_RDONLY {
            return;
        }

        if let Some(mut item) = self.read_dir_entry(dev, file.p_index) {
            item.file_size = file.size;
            item.fst_clus_hi = (file.sblk >> 16) as u16;
            item.fst_clus_lo = (file.sblk & 0xffff) as u16;
            let _ = self.write_dir_entry(dev, &item, file.p_index);
        }
    }

    /// Absolute reposition (only whence == 0 is supported): walk the chain
    /// from the start cluster, failing if `offset` runs off it.
    pub(crate) fn seek(
        &mut self,
        dev: &mut dyn BlockDev,
        file: &mut File,
        offset: u32,
        whence: i32,
    ) -> Result<(), FsError> {
        if whence != 0 {
            return Err(FsError::NotSupported);
        }

        let mut curr_cluster = file.sblk;
        let mut curr_pos = 0u32;
        let mut to_move = offset;

        while to_move > 0 {
            let c_offset = curr_pos % self.cluster_byte_size;
            let mut curr_move = to_move;

            if c_offset + curr_move < self.cluster_byte_size {
                curr_pos += curr_move;
                break;
            }

            curr_move = self.cluster_byte_size - c_offset;
            curr_pos += curr_move;
            to_move -= curr_move;

            curr_cluster = self.cluster_get_next(dev, curr_cluster);
            if !cluster_is_valid(curr_cluster) {
                return Err(FsError::BadCluster);
            }
        }

        file.pos = curr_pos;
        file.cblk = curr_cluster;
        Ok(())
    }

    pub(crate) fn opendir(&mut self, dir: &mut Dir) {
        dir.index = 0;
    }

    /// Next user-visible entry (normal files and directories); END stops the
    /// scan, FREE and special-attribute entries are skipped.
    pub(crate) fn readdir(
        &mut self,
        dev: &mut dyn BlockDev,
        dir: &mut Dir,
        dirent: &mut Dirent,
    ) -> Result<(), FsError> {
        while (dir.index as u32) < self.root_ent_cnt {
            let item = self
                .read_dir_entry(dev, dir.index)
                .ok_or(FsError::DeviceError)?;

            if item.name[0] == DIRITEM_NAME_END {
                break;
            }

            if item.name[0] != DIRITEM_NAME_FREE {
                let kind = diritem_get_type(&item);
                if kind == FileKind::Normal || kind == FileKind::Dir {
                    dirent.size = item.file_size as i32;
                    dirent.kind = kind as i32;
                    diritem_get_name(&item, &mut dirent.name);
                    dirent.index = dir.index;
                    dir.index += 1;
                    return Ok(());
                }
            }

            dir.index += 1;
        }

        Err(FsError::NotFound)
    }

    /// Remove a root directory entry and free its chain.
    pub(crate) fn unlink(&mut self, dev: &mut dyn BlockDev, path: &[u8]) -> Result<(), FsError> {
        for i in 0..self.root_ent_cnt as i32 {
            let item = self.read_dir_entry(dev, i).ok_or(FsError::DeviceError)?;

            if item.name[0] == DIRITEM_NAME_END {
                break;
            }
            if item.name[0] == DIRITEM_NAME_FREE {
                continue;
            }

            if diritem_name_match(&item, path) {
                let cluster = item.start_cluster();
                self.cluster_free_chain(dev, cluster);

                let empty: DirItem = unsafe { core::mem::zeroed() };
                return self.write_dir_entry(dev, &empty, i);
            }
        }

        Err(FsError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{O_RDWR, O_WRONLY};
    use crate::util;

    const BPS: usize = 512;
    const SPC: u32 = 2; // 1024-byte clusters
    const RSVD: u32 = 1;
    const FAT_SECTORS: u32 = 4;
    const NUM_FATS: u32 = 2;
    const ROOT_ENTRIES: u32 = 64; // 4 root sectors
    const DATA_SECTORS: u32 = 256;

    struct MemDisk {
        data: Vec<u8>,
    }

    impl MemDisk {
        fn formatted() -> MemDisk {
            let root_sectors = ROOT_ENTRIES * 32 / BPS as u32;
            let total = RSVD + NUM_FATS * FAT_SECTORS + root_sectors + DATA_SECTORS;
            let mut data = vec![0u8; total as usize * BPS];

            // DBR
            data[11..13].copy_from_slice(&(BPS as u16).to_le_bytes());
            data[13] = SPC as u8;
            data[14..16].copy_from_slice(&(RSVD as u16).to_le_bytes());
            data[16] = NUM_FATS as u8;
            data[17..19].copy_from_slice(&(ROOT_ENTRIES as u16).to_le_bytes());
            data[22..24].copy_from_slice(&(FAT_SECTORS as u16).to_le_bytes());
            data[510] = 0x55;
            data[511] = 0xaa;

            let mut disk = MemDisk { data };
            // Reserved FAT entries in both copies.
            disk.set_fat_raw(0, 0xfff8);
            disk.set_fat_raw(1, 0xffff);
            disk
        }

        fn fat_offset(copy: u32, index: u32) -> usize {
            ((RSVD + copy * FAT_SECTORS) * BPS as u32 + index * 2) as usize
        }

        fn fat_entry(&self, index: u32) -> u16 {
            let off = Self::fat_offset(0, index);
            u16::from_le_bytes([self.data[off], self.data[off + 1]])
        }

        fn fat_entry_copy2(&self, index: u32) -> u16 {
            let off = Self::fat_offset(1, index);
            u16::from_le_bytes([self.data[off], self.data[off + 1]])
        }

        fn set_fat_raw(&mut self, index: u32, value: u16) {
            for copy in 0..NUM_FATS {
                let off = Self::fat_offset(copy, index);
                self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
            }
        }

        fn root_entry_offset(slot: u32) -> usize {
            ((RSVD + NUM_FATS * FAT_SECTORS) * BPS as u32 + slot * 32) as usize
        }

        fn put_dir_entry(&mut self, slot: u32, name: &[u8], attr: u8, start: u16, size: u32) {
            let off = Self::root_entry_offset(slot);
            let mut sfn = [0u8; 11];
            to_sfn(&mut sfn, name);
            self.data[off..off + 11].copy_from_slice(&sfn);
            self.data[off + 11] = attr;
            self.data[off + 20..off + 22].copy_from_slice(&0u16.to_le_bytes()); // clus hi
            self.data[off + 26..off + 28].copy_from_slice(&start.to_le_bytes());
            self.data[off + 28..off + 32].copy_from_slice(&size.to_le_bytes());
        }

        fn raw_dir_entry(&self, slot: u32) -> &[u8] {
            let off = Self::root_entry_offset(slot);
            &self.data[off..off + 32]
        }

        fn cluster_offset(cluster: u32) -> usize {
            let root_sectors = ROOT_ENTRIES * 32 / BPS as u32;
            let data_start = RSVD + NUM_FATS * FAT_SECTORS + root_sectors;
            (data_start * BPS as u32 + (cluster - 2) * SPC * BPS as u32) as usize
        }

        fn put_file(&mut self, slot: u32, name: &[u8], content: &[u8]) {
            let cbs = (SPC as usize) * BPS;
            let nclusters = core::cmp::max(1, (content.len() + cbs - 1) / cbs) as u32;

            // Take clusters 2.. for simplicity; chain them in order.
            let first = 2 + slot * 8;
            for i in 0..nclusters {
                let next = if i + 1 == nclusters {
                    0xfff8
                } else {
                    (first + i + 1) as u16
                };
                self.set_fat_raw(first + i, next);
                let off = Self::cluster_offset(first + i);
                let lo = (i as usize) * cbs;
                let hi = core::cmp::min(lo + cbs, content.len());
                if lo < content.len() {
                    self.data[off..off + (hi - lo)].copy_from_slice(&content[lo..hi]);
                }
            }
            self.put_dir_entry(slot, name, 0, first as u16, content.len() as u32);
        }
    }

    impl BlockDev for MemDisk {
        fn read(&mut self, sector: u32, buf: &mut [u8], count: u32) -> i32 {
            let off = sector as usize * BPS;
            let len = count as usize * BPS;
            buf[..len].copy_from_slice(&self.data[off..off + len]);
            count as i32
        }

        fn write(&mut self, sector: u32, buf: &[u8], count: u32) -> i32 {
            let off = sector as usize * BPS;
            let len = count as usize * BPS;
            self.data[off..off + len].copy_from_slice(&buf[..len]);
            count as i32
        }
    }

    fn mounted() -> (MemDisk, Fat) {
        let mut disk = MemDisk::formatted();
        let fat = Fat::mount(&mut disk).expect("mount");
        (disk, fat)
    }

    fn open_file(fat: &mut Fat, disk: &mut MemDisk, path: &[u8], mode: u32) -> Result<File, FsError> {
        let mut file = File::zeroed();
        file.mode = mode;
        fat.open(disk, path, &mut file)?;
        Ok(file)
    }

    fn chain_from(disk: &MemDisk, start: u32) -> Vec<u32> {
        let mut chain = vec![];
        let mut c = start;
        while cluster_is_valid(c) {
            chain.push(c);
            c = disk.fat_entry(c) as u32;
            assert!(chain.len() < 64, "unterminated chain");
        }
        chain
    }

    #[test]
    fn mount_derives_the_layout() {
        let (_, fat) = mounted();
        assert_eq!(fat.bytes_per_sec, 512);
        assert_eq!(fat.sec_per_cluster, SPC);
        assert_eq!(fat.cluster_byte_size, 1024);
        assert_eq!(fat.tbl_start, RSVD);
        assert_eq!(fat.root_start, RSVD + NUM_FATS * FAT_SECTORS);
        assert_eq!(fat.data_start, fat.root_start + ROOT_ENTRIES * 32 / 512);
    }

    #[test]
    fn sfn_conversion() {
        let mut sfn = [0u8; 11];
        to_sfn(&mut sfn, b"hello.txt");
        assert_eq!(&sfn, b"HELLO   TXT");

        to_sfn(&mut sfn, b"a.b");
        assert_eq!(&sfn, b"A       B  ");

        to_sfn(&mut sfn, b"noext");
        assert_eq!(&sfn, b"NOEXT      ");
    }

    #[test]
    fn sfn_name_roundtrip() {
        let item = DirItem::init(0, b"hello.txt");
        let mut name = [0u8; 16];
        diritem_get_name(&item, &mut name);
        assert_eq!(util::name_bytes(&name), b"HELLO.TXT");

        let item = DirItem::init(0, b"noext");
        diritem_get_name(&item, &mut name);
        assert_eq!(util::name_bytes(&name), b"NOEXT");
    }

    #[test]
    fn open_reads_metadata_case_insensitively() {
        let (mut disk, mut fat) = mounted();
        disk.put_file(0, b"hello.txt", b"Hello\n");

        let file = open_file(&mut fat, &mut disk, b"HELLO.TXT", O_RDONLY).unwrap();
        assert_eq!(file.size, 6);
        assert_eq!(file.pos, 0);
        assert_eq!(file.sblk, 2);
        assert_eq!(file.cblk, 2);
        assert_eq!(file.kind, FileKind::Normal);
    }

    #[test]
    fn open_missing_file_fails_without_creat() {
        let (mut disk, mut fat) = mounted();
        assert!(open_file(&mut fat, &mut disk, b"nothere.txt", O_RDONLY).is_err());
    }

    #[test]
    fn read_stops_at_size_then_returns_zero() {
        let (mut disk, mut fat) = mounted();
        disk.put_file(0, b"hello.txt", b"Hello\n");

        let mut file = open_file(&mut fat, &mut disk, b"hello.txt", O_RDONLY).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fat.read(&mut disk, &mut file, &mut buf), 6);
        assert_eq!(&buf[..6], b"Hello\n");
        assert_eq!(fat.read(&mut disk, &mut file, &mut buf), 0);
    }

    #[test]
    fn read_crosses_cluster_boundaries() {
        let (mut disk, mut fat) = mounted();
        let content: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        disk.put_file(0, b"big.bin", &content);

        let mut file = open_file(&mut fat, &mut disk, b"big.bin", O_RDONLY).unwrap();
        let mut buf = vec![0u8; 2000];
        assert_eq!(fat.read(&mut disk, &mut file, &mut buf), 1500);
        assert_eq!(&buf[..1500], &content[..]);
    }

    #[test]
    fn creat_claims_a_directory_slot() {
        let (mut disk, mut fat) = mounted();

        let file = open_file(&mut fat, &mut disk, b"new.txt", O_WRONLY | O_CREAT).unwrap();
        assert_eq!(file.size, 0);
        assert!(!cluster_is_valid(file.sblk));

        // Entry is on disk and findable without O_CREAT.
        let again = open_file(&mut fat, &mut disk, b"new.txt", O_RDONLY).unwrap();
        assert_eq!(again.p_index, file.p_index);
        assert_eq!(&disk.raw_dir_entry(0)[..11], b"NEW     TXT");
    }

    #[test]
    fn write_extends_across_clusters() {
        let (mut disk, mut fat) = mounted();
        let content: Vec<u8> = (0..1500u32).map(|i| (i % 163) as u8).collect();

        let mut file = open_file(&mut fat, &mut disk, b"out.bin", O_WRONLY | O_CREAT).unwrap();
        assert_eq!(fat.write(&mut disk, &mut file, &content), 1500);
        assert_eq!(file.size, 1500);
        fat.close(&mut disk, &file);

        // Exactly ceil(1500/1024) = 2 clusters, chain terminated.
        let reopened = open_file(&mut fat, &mut disk, b"out.bin", O_RDONLY).unwrap();
        assert_eq!(reopened.size, 1500);
        let chain = chain_from(&disk, reopened.sblk);
        assert_eq!(chain.len(), 2);
        assert!(disk.fat_entry(chain[1]) >= 0xfff8);

        let mut file = open_file(&mut fat, &mut disk, b"out.bin", O_RDONLY).unwrap();
        let mut buf = vec![0u8; 1600];
        assert_eq!(fat.read(&mut disk, &mut file, &mut buf), 1500);
        assert_eq!(&buf[..1500], &content[..]);
    }

    #[test]
    fn fat_writes_are_mirrored_to_every_copy() {
        let (mut disk, mut fat) = mounted();
        let mut file = open_file(&mut fat, &mut disk, b"m.bin", O_WRONLY | O_CREAT).unwrap();
        fat.write(&mut disk, &mut file, &[0xabu8; 100]);

        let c = file.sblk;
        assert!(cluster_is_valid(c));
        assert_eq!(disk.fat_entry(c), disk.fat_entry_copy2(c));
        assert!(disk.fat_entry(c) >= 0xfff8);
    }

    #[test]
    fn exact_cluster_write_does_not_overallocate() {
        let (mut disk, mut fat) = mounted();
        let mut file = open_file(&mut fat, &mut disk, b"even.bin", O_WRONLY | O_CREAT).unwrap();

        assert_eq!(fat.write(&mut disk, &mut file, &[7u8; 2048]), 2048);
        assert_eq!(file.size, 2048);
        let chain = chain_from(&disk, file.sblk);
        assert_eq!(chain.len(), 2, "no cluster past EOF");
    }

    #[test]
    fn append_after_exact_boundary_links_at_the_tail() {
        let (mut disk, mut fat) = mounted();
        let mut file = open_file(&mut fat, &mut disk, b"app.bin", O_WRONLY | O_CREAT).unwrap();

        fat.write(&mut disk, &mut file, &[1u8; 1024]);
        fat.write(&mut disk, &mut file, &[2u8; 100]);
        assert_eq!(file.size, 1124);
        fat.close(&mut disk, &file);

        let mut file = open_file(&mut fat, &mut disk, b"app.bin", O_RDONLY).unwrap();
        let chain = chain_from(&disk, file.sblk);
        assert_eq!(chain.len(), 2);

        let mut buf = vec![0u8; 1200];
        assert_eq!(fat.read(&mut disk, &mut file, &mut buf), 1124);
        assert!(buf[..1024].iter().all(|&b| b == 1));
        assert!(buf[1024..1124].iter().all(|&b| b == 2));
    }

    #[test]
    fn growth_within_the_last_cluster_allocates_nothing() {
        let (mut disk, mut fat) = mounted();
        let mut file = open_file(&mut fat, &mut disk, b"sm.bin", O_WRONLY | O_CREAT).unwrap();

        fat.write(&mut disk, &mut file, &[1u8; 100]);
        let before = chain_from(&disk, file.sblk).len();
        fat.write(&mut disk, &mut file, &[2u8; 100]);
        assert_eq!(chain_from(&disk, file.sblk).len(), before);
        assert_eq!(file.size, 200);
    }

    #[test]
    fn trunc_frees_the_chain() {
        let (mut disk, mut fat) = mounted();
        let content = vec![9u8; 1500];
        disk.put_file(0, b"t.bin", &content);
        let clusters = {
            let f = open_file(&mut fat, &mut disk, b"t.bin", O_RDONLY).unwrap();
            chain_from(&disk, f.sblk)
        };

        let file = open_file(&mut fat, &mut disk, b"t.bin", O_RDWR | O_TRUNC).unwrap();
        assert_eq!(file.size, 0);
        assert!(!cluster_is_valid(file.sblk));
        for c in clusters {
            assert_eq!(disk.fat_entry(c), 0, "cluster {} still allocated", c);
        }
    }

    #[test]
    fn close_writes_back_size_and_start_cluster() {
        let (mut disk, mut fat) = mounted();
        let mut file = open_file(&mut fat, &mut disk, b"wb.bin", O_WRONLY | O_CREAT).unwrap();
        let slot = file.p_index as u32;
        fat.write(&mut disk, &mut file, &[3u8; 321]);
        fat.close(&mut disk, &file);

        let raw = disk.raw_dir_entry(slot);
        let size = u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]);
        let start = u16::from_le_bytes([raw[26], raw[27]]);
        assert_eq!(size, 321);
        assert_eq!(start as u32, file.sblk);
    }

    #[test]
    fn readonly_close_does_not_touch_the_entry() {
        let (mut disk, mut fat) = mounted();
        disk.put_file(0, b"ro.bin", b"abc");
        let before = disk.raw_dir_entry(0).to_vec();

        let file = open_file(&mut fat, &mut disk, b"ro.bin", O_RDONLY).unwrap();
        fat.close(&mut disk, &file);
        assert_eq!(disk.raw_dir_entry(0), &before[..]);
    }

    #[test]
    fn seek_walks_clusters_and_rejects_offsets_off_the_chain() {
        let (mut disk, mut fat) = mounted();
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 199) as u8).collect();
        disk.put_file(0, b"s.bin", &content);

        let mut file = open_file(&mut fat, &mut disk, b"s.bin", O_RDONLY).unwrap();
        fat.seek(&mut disk, &mut file, 2048, 0).unwrap();
        assert_eq!(file.pos, 2048);

        let mut buf = [0u8; 4];
        assert_eq!(fat.read(&mut disk, &mut file, &mut buf), 4);
        assert_eq!(&buf, &content[2048..2052]);

        // Repositioning backwards restarts from the start cluster.
        fat.seek(&mut disk, &mut file, 1, 0).unwrap();
        assert_eq!(fat.read(&mut disk, &mut file, &mut buf), 4);
        assert_eq!(&buf, &content[1..5]);

        assert!(fat.seek(&mut disk, &mut file, 10_000, 0).is_err());
        assert!(fat.seek(&mut disk, &mut file, 0, 1).is_err());
    }

    #[test]
    fn unlink_clears_the_entry_and_the_chain() {
        let (mut disk, mut fat) = mounted();
        disk.put_file(0, b"gone.txt", &[5u8; 1500]);
        let chain = {
            let f = open_file(&mut fat, &mut disk, b"gone.txt", O_RDONLY).unwrap();
            chain_from(&disk, f.sblk)
        };

        fat.unlink(&mut disk, b"gone.txt").unwrap();
        assert!(open_file(&mut fat, &mut disk, b"gone.txt", O_RDONLY).is_err());
        assert!(disk.raw_dir_entry(0).iter().all(|&b| b == 0));
        for c in chain {
            assert_eq!(disk.fat_entry(c), 0);
        }

        assert!(fat.unlink(&mut disk, b"gone.txt").is_err());
    }

    #[test]
    fn readdir_filters_special_entries() {
        let (mut disk, mut fat) = mounted();
        disk.put_dir_entry(0, b"vol", DirAttr::VOLUME_ID.bits(), 0, 0);
        disk.put_file(1, b"a.txt", b"aaa");
        // A freed slot in the middle.
        let off = MemDisk::root_entry_offset(2);
        disk.data[off] = DIRITEM_NAME_FREE;
        disk.put_dir_entry(3, b"subdir", DirAttr::DIRECTORY.bits(), 0, 0);

        let mut dir = Dir { index: 0 };
        let mut ent = Dirent::zeroed();

        fat.readdir(&mut disk, &mut dir, &mut ent).unwrap();
        assert_eq!(util::name_bytes(&ent.name), b"A.TXT");
        assert_eq!(ent.kind, FileKind::Normal as i32);
        assert_eq!(ent.size, 3);

        fat.readdir(&mut disk, &mut dir, &mut ent).unwrap();
        assert_eq!(util::name_bytes(&ent.name), b"SUBDIR");
        assert_eq!(ent.kind, FileKind::Dir as i32);

        assert!(fat.readdir(&mut disk, &mut dir, &mut ent).is_err());
    }

    #[test]
    fn readdir_on_empty_volume_ends_immediately() {
        let (mut disk, mut fat) = mounted();
        let mut dir = Dir { index: 0 };
        let mut ent = Dirent::zeroed();
        assert!(fat.readdir(&mut disk, &mut dir, &mut ent).is_err());
        assert_eq!(dir.index, 0);
    }

    #[test]
    fn alloc_free_builds_a_terminated_chain_avoiding_used_clusters() {
        let (mut disk, mut fat) = mounted();
        disk.put_file(0, b"used.bin", &[1u8; 3000]); // clusters 2, 3, 4

        let start = fat.cluster_alloc_free(&mut disk, 3).unwrap();
        let chain = chain_from(&disk, start);
        assert_eq!(chain.len(), 3);
        for c in &chain {
            assert!(![2u32, 3, 4].contains(c), "overlaps existing chain");
        }
        assert!(disk.fat_entry(chain[2]) >= 0xfff8);
    }
}
