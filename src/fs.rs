// The VFS: a fixed pool of filesystem descriptors, a mounted list scanned
// in insertion order for a path-prefix match, and the syscall-facing file
// API. The VFS never parses directories itself; whatever follows the mount
// point is handed to the filesystem as one residual string.

use crate::constants::*;
use crate::dev::DevBlock;
use crate::devfs;
use crate::fatfs::Fat;
use crate::file::{self, File, FileId, FileKind};
use crate::sync::Mutex;
use crate::task;
use crate::util;
use crate::{dev, ide};
use core::cell::UnsafeCell;

/// Why a filesystem operation failed. The syscall layer folds these into
/// the ABI's -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FsError {
    InvalidPath,
    NotFound,
    NoFreeFile,
    NoFreeFd,
    DeviceError,
    BadVolume,
    BadCluster,
    NoSpace,
    NotSupported,
}

/// Minimal stat block shared with user space.
#[repr(C)]
pub(crate) struct Stat {
    pub(crate) st_dev: u32,
    pub(crate) st_ino: u32,
    pub(crate) st_mode: u32,
    pub(crate) st_nlink: u32,
    pub(crate) st_uid: u32,
    pub(crate) st_gid: u32,
    pub(crate) st_rdev: u32,
    pub(crate) st_size: u32,
    pub(crate) st_blksize: u32,
    pub(crate) st_blocks: u32,
}

pub(crate) const S_IFREG: u32 = 0x8000;
pub(crate) const S_IFDIR: u32 = 0x4000;
pub(crate) const S_IFCHR: u32 = 0x2000;

/// Kernel view of the user DIR handle: a 0-based root directory index.
#[repr(C)]
pub(crate) struct Dir {
    pub(crate) index: i32,
}

/// Directory entry returned by readdir.
#[repr(C)]
pub(crate) struct Dirent {
    pub(crate) index: i32,
    pub(crate) kind: i32,
    pub(crate) name: [u8; 255],
    pub(crate) size: i32,
}

impl Dirent {
    #[allow(dead_code)]
    pub(crate) fn zeroed() -> Dirent {
        unsafe { core::mem::zeroed() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FsType {
    DevFs,
    Fat16,
}

/// Filesystem-private state; the dispatch below matches on it.
pub(crate) enum FsData {
    Dev,
    Fat(Fat),
}

/// One mounted filesystem.
pub(crate) struct Fs {
    mount_point: [u8; FS_MOUNT_SIZE],
    #[allow(dead_code)]
    kind: FsType,
    dev_id: i32,
    mutex: Mutex,
    data: UnsafeCell<FsData>,
}

impl Fs {
    /// Safety: caller must hold `self.mutex`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn data_mut(&self) -> &mut FsData {
        &mut *self.data.get()
    }
}

struct MountTable {
    entries: [Option<Fs>; FS_TABLE_SIZE],
    /// Indices into `entries`, in mount order.
    mounted: [usize; FS_TABLE_SIZE],
    mounted_cnt: usize,
    root: Option<usize>,
}

struct Mounts(UnsafeCell<MountTable>);

// Written only during single-threaded boot (fs_init); read-only afterwards.
unsafe impl Sync for Mounts {}

static MOUNTS: Mounts = Mounts(UnsafeCell::new(MountTable {
    entries: [const { None }; FS_TABLE_SIZE],
    mounted: [0; FS_TABLE_SIZE],
    mounted_cnt: 0,
    root: None,
}));

fn fs_ref(index: usize) -> &'static Fs {
    unsafe {
        (*MOUNTS.0.get()).entries[index]
            .as_ref()
            .expect("stale fs index")
    }
}

// Path helpers ---------------------------------------------------------

/// Does `path` start with the whole of `prefix`?
pub(crate) fn path_begin_with(path: &[u8], prefix: &[u8]) -> bool {
    let prefix = util::name_bytes(prefix);
    path.len() >= prefix.len() && &path[..prefix.len()] == prefix
}

/// Strip the first path component: "/dev/tty0" → "tty0".
pub(crate) fn path_next_child(path: &[u8]) -> Option<&[u8]> {
    let mut i = 0;
    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    while i < path.len() && path[i] != b'/' {
        i += 1;
    }
    if i < path.len() {
        i += 1; // the separator itself
    }
    if i < path.len() {
        Some(&path[i..])
    } else {
        None
    }
}

/// Decimal tail of a device path ("0" in "tty0").
pub(crate) fn path_to_num(path: &[u8]) -> Option<u32> {
    let mut n = 0u32;
    for &c in path {
        if !c.is_ascii_digit() {
            return None;
        }
        n = n * 10 + (c - b'0') as u32;
    }
    Some(n)
}

fn is_path_valid(path: &[u8]) -> bool {
    !path.is_empty()
}

// Filesystem op dispatch ------------------------------------------------

fn fs_protect(fs: &Fs) {
    fs.mutex.lock();
}

fn fs_unprotect(fs: &Fs) {
    fs.mutex.unlock();
}

fn op_open(fs: &Fs, path: &[u8], f: &mut File) -> Result<(), FsError> {
    match unsafe { fs.data_mut() } {
        FsData::Dev => devfs::open(path, f),
        FsData::Fat(fat) => fat.open(&mut DevBlock(fs.dev_id), path, f),
    }
}

fn op_read(fs: &Fs, f: &mut File, buf: &mut [u8]) -> u32 {
    match unsafe { fs.data_mut() } {
        FsData::Dev => devfs::read(f, buf),
        FsData::Fat(fat) => fat.read(&mut DevBlock(fs.dev_id), f, buf),
    }
}

fn op_write(fs: &Fs, f: &mut File, buf: &[u8]) -> u32 {
    match unsafe { fs.data_mut() } {
        FsData::Dev => devfs::write(f, buf),
        FsData::Fat(fat) => fat.write(&mut DevBlock(fs.dev_id), f, buf),
    }
}

fn op_close(fs: &Fs, f: &File) {
    match unsafe { fs.data_mut() } {
        FsData::Dev => devfs::close(f),
        FsData::Fat(fat) => fat.close(&mut DevBlock(fs.dev_id), f),
    }
}

fn op_seek(fs: &Fs, f: &mut File, offset: u32, whence: i32) -> Result<(), FsError> {
    match unsafe { fs.data_mut() } {
        FsData::Dev => devfs::seek(f, offset, whence),
        FsData::Fat(fat) => fat.seek(&mut DevBlock(fs.dev_id), f, offset, whence),
    }
}

fn op_stat(fs: &Fs, f: &File, st: &mut Stat) -> Result<(), FsError> {
    match unsafe { fs.data_mut() } {
        FsData::Dev => devfs::stat(f, st),
        FsData::Fat(_) => {
            st.st_size = f.size;
            st.st_mode = match f.kind {
                FileKind::Dir => S_IFDIR,
                FileKind::Tty => S_IFCHR,
                _ => S_IFREG,
            };
            Ok(())
        }
    }
}

fn op_ioctl(fs: &Fs, f: &File, cmd: i32, arg0: u32, arg1: u32) -> i32 {
    match unsafe { fs.data_mut() } {
        FsData::Dev => devfs::ioctl(f, cmd, arg0, arg1),
        FsData::Fat(_) => -1,
    }
}

// Mounting ---------------------------------------------------------------

/// Attach a filesystem at `mount_point`. Boot-time only.
fn mount(kind: FsType, mount_point: &[u8], dev_major: u32, dev_minor: u32) -> Option<usize> {
    println!(
        "mounting {} (dev {:#x}:{:#x})",
        core::str::from_utf8(mount_point).unwrap_or("?"),
        dev_major,
        dev_minor
    );

    let table = unsafe { &mut *MOUNTS.0.get() };

    for i in 0..table.mounted_cnt {
        let fs = table.entries[table.mounted[i]].as_ref().unwrap();
        if util::name_bytes(&fs.mount_point) == mount_point {
            println!("filesystem already mounted");
            return None;
        }
    }

    let slot = (0..FS_TABLE_SIZE).find(|&i| table.entries[i].is_none())?;

    let (data, dev_id) = match kind {
        FsType::DevFs => (FsData::Dev, -1),
        FsType::Fat16 => {
            let dev_id = dev::dev_open(dev_major, dev_minor)?;
            match Fat::mount(&mut DevBlock(dev_id)) {
                Ok(fat) => (FsData::Fat(fat), dev_id),
                Err(_) => {
                    println!("fat16 mount failed");
                    dev::dev_close(dev_id);
                    return None;
                }
            }
        }
    };

    let mut fs = Fs {
        mount_point: [0; FS_MOUNT_SIZE],
        kind,
        dev_id,
        mutex: Mutex::new(),
        data: UnsafeCell::new(data),
    };
    util::copy_name(&mut fs.mount_point, mount_point);

    table.entries[slot] = Some(fs);
    table.mounted[table.mounted_cnt] = slot;
    table.mounted_cnt += 1;
    Some(slot)
}

/// Probe the disks and set up the two system mounts: devfs at /dev and the
/// root FAT16 volume at /home.
pub(crate) fn fs_init() {
    ide::disk_init();

    mount(FsType::DevFs, b"/dev", 0, 0).expect("mount /dev failed");

    let root = mount(FsType::Fat16, b"/home", ROOT_DEV_MAJOR, ROOT_DEV_MINOR)
        .expect("mount /home failed");
    unsafe {
        (*MOUNTS.0.get()).root = Some(root);
    }
}

/// First mounted filesystem whose mount point prefixes `name`, plus the
/// residual path; the root filesystem sees the full name otherwise.
fn resolve_fs<'a>(name: &'a [u8]) -> Option<(usize, &'a [u8])> {
    let table = unsafe { &*MOUNTS.0.get() };

    for i in 0..table.mounted_cnt {
        let idx = table.mounted[i];
        let fs = table.entries[idx].as_ref().unwrap();
        if path_begin_with(name, &fs.mount_point) {
            return Some((idx, path_next_child(name).unwrap_or(b"")));
        }
    }

    table.root.map(|idx| (idx, name))
}

fn root_fs() -> Option<&'static Fs> {
    let table = unsafe { &*MOUNTS.0.get() };
    table.root.map(fs_ref)
}

// Syscall layer -----------------------------------------------------------

fn is_fd_bad(fd: i32) -> bool {
    fd < 0 || fd as usize >= TASK_OFILE_NR
}

fn open_inner(name: &[u8], flags: u32) -> Result<i32, FsError> {
    let file_id = file::file_alloc().ok_or(FsError::NoFreeFile)?;

    let fd = match task::task_alloc_fd(file_id) {
        Some(fd) => fd,
        None => {
            file::file_free(file_id);
            return Err(FsError::NoFreeFd);
        }
    };

    let (fs_idx, residual) = match resolve_fs(name) {
        Some(found) => found,
        None => {
            file::file_free(file_id);
            task::task_remove_fd(fd);
            return Err(FsError::NotFound);
        }
    };

    let fs = fs_ref(fs_idx);
    fs_protect(fs);
    let result = {
        let f = unsafe { file::file_mut(file_id) };
        f.mode = flags;
        f.fs = Some(fs_idx);
        util::copy_name(&mut f.name, residual);
        op_open(fs, residual, f)
    };
    fs_unprotect(fs);

    match result {
        Ok(()) => Ok(fd),
        Err(err) => {
            println!("open failed");
            file::file_free(file_id);
            task::task_remove_fd(fd);
            Err(err)
        }
    }
}

pub(crate) fn sys_open(name: *const u8, flags: u32) -> i32 {
    if name.is_null() {
        return -1;
    }
    let name = unsafe { util::cstr_bytes(name, FS_MOUNT_SIZE + FILE_NAME_SIZE) };
    if !is_path_valid(name) {
        return -1;
    }
    match open_inner(name, flags) {
        Ok(fd) => fd,
        Err(_) => -1,
    }
}

pub(crate) fn sys_read(fd: i32, ptr: *mut u8, len: i32) -> i32 {
    if is_fd_bad(fd) || ptr.is_null() || len <= 0 {
        return 0;
    }

    let file_id = match task::task_file(fd) {
        Some(id) => id,
        None => {
            println!("file not opened");
            return -1;
        }
    };

    let buf = unsafe { core::slice::from_raw_parts_mut(ptr, len as usize) };
    let f = unsafe { file::file_mut(file_id) };
    if !f.readable() {
        println!("file is write only");
        return -1;
    }

    let fs = match f.fs {
        Some(idx) => fs_ref(idx),
        None => return -1,
    };

    fs_protect(fs);
    let n = op_read(fs, f, buf);
    fs_unprotect(fs);
    n as i32
}

pub(crate) fn sys_write(fd: i32, ptr: *const u8, len: i32) -> i32 {
    if is_fd_bad(fd) || ptr.is_null() || len <= 0 {
        return 0;
    }

    let file_id = match task::task_file(fd) {
        Some(id) => id,
        None => {
            println!("file not opened");
            return -1;
        }
    };

    let buf = unsafe { core::slice::from_raw_parts(ptr, len as usize) };
    let f = unsafe { file::file_mut(file_id) };
    if !f.writable() {
        println!("file is read only");
        return -1;
    }

    let fs = match f.fs {
        Some(idx) => fs_ref(idx),
        None => return -1,
    };

    fs_protect(fs);
    let n = op_write(fs, f, buf);
    fs_unprotect(fs);
    n as i32
}

pub(crate) fn sys_lseek(fd: i32, offset: u32, whence: i32) -> i32 {
    if is_fd_bad(fd) {
        return -1;
    }

    let file_id = match task::task_file(fd) {
        Some(id) => id,
        None => {
            println!("file not opened");
            return -1;
        }
    };

    let f = unsafe { file::file_mut(file_id) };
    let fs = match f.fs {
        Some(idx) => fs_ref(idx),
        None => return -1,
    };

    fs_protect(fs);
    let result = op_seek(fs, f, offset, whence);
    fs_unprotect(fs);

    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

pub(crate) fn sys_close(fd: i32) -> i32 {
    if is_fd_bad(fd) {
        println!("bad fd on close: {}", fd);
        return -1;
    }

    let file_id = match task::task_file(fd) {
        Some(id) => id,
        None => {
            println!("file not opened");
            return -1;
        }
    };

    if file::file_dec_ref(file_id) {
        let f = unsafe { file::file_mut(file_id) };
        if let Some(idx) = f.fs {
            let fs = fs_ref(idx);
            fs_protect(fs);
            op_close(fs, f);
            fs_unprotect(fs);
        }
        file::file_free(file_id);
    }

    task::task_remove_fd(fd);
    0
}

pub(crate) fn sys_isatty(fd: i32) -> i32 {
    if is_fd_bad(fd) {
        return 0;
    }

    match task::task_file(fd) {
        Some(id) => {
            let f = unsafe { file::file_mut(id) };
            (f.kind == FileKind::Tty) as i32
        }
        None => {
            println!("file not opened");
            -1
        }
    }
}

pub(crate) fn sys_fstat(fd: i32, st: *mut Stat) -> i32 {
    if is_fd_bad(fd) || st.is_null() {
        return -1;
    }

    let file_id = match task::task_file(fd) {
        Some(id) => id,
        None => {
            println!("file not opened");
            return -1;
        }
    };

    let st = unsafe { &mut *st };
    *st = unsafe { core::mem::zeroed() };

    let f = unsafe { file::file_mut(file_id) };
    let fs = match f.fs {
        Some(idx) => fs_ref(idx),
        None => return -1,
    };

    fs_protect(fs);
    let result = op_stat(fs, f, st);
    fs_unprotect(fs);

    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

pub(crate) fn sys_dup(fd: i32) -> i32 {
    if is_fd_bad(fd) {
        return -1;
    }

    let file_id = match task::task_file(fd) {
        Some(id) => id,
        None => {
            println!("file not opened");
            return -1;
        }
    };

    match task::task_alloc_fd(file_id) {
        Some(new_fd) => {
            file::file_inc_ref(file_id);
            new_fd
        }
        None => {
            println!("no free fd for dup");
            -1
        }
    }
}

pub(crate) fn sys_opendir(_path: *const u8, dir: *mut Dir) -> i32 {
    if dir.is_null() {
        return -1;
    }
    let fs = match root_fs() {
        Some(fs) => fs,
        None => return -1,
    };
    let dir = unsafe { &mut *dir };

    fs_protect(fs);
    match unsafe { fs.data_mut() } {
        FsData::Fat(fat) => fat.opendir(dir),
        FsData::Dev => {
            fs_unprotect(fs);
            return -1;
        }
    }
    fs_unprotect(fs);
    0
}

pub(crate) fn sys_readdir(dir: *mut Dir, dirent: *mut Dirent) -> i32 {
    if dir.is_null() || dirent.is_null() {
        return -1;
    }
    let fs = match root_fs() {
        Some(fs) => fs,
        None => return -1,
    };
    let dir = unsafe { &mut *dir };
    let dirent = unsafe { &mut *dirent };

    fs_protect(fs);
    let result = match unsafe { fs.data_mut() } {
        FsData::Fat(fat) => fat.readdir(&mut DevBlock(fs.dev_id), dir, dirent),
        FsData::Dev => Err(FsError::NotSupported),
    };
    fs_unprotect(fs);

    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

pub(crate) fn sys_closedir(_dir: *mut Dir) -> i32 {
    0
}

pub(crate) fn sys_ioctl(fd: i32, cmd: i32, arg0: u32, arg1: u32) -> i32 {
    if is_fd_bad(fd) {
        println!("bad fd on ioctl: {}", fd);
        return -1;
    }

    let file_id = match task::task_file(fd) {
        Some(id) => id,
        None => {
            println!("file not opened");
            return -1;
        }
    };

    let f = unsafe { file::file_mut(file_id) };
    let fs = match f.fs {
        Some(idx) => fs_ref(idx),
        None => return -1,
    };

    fs_protect(fs);
    let ret = op_ioctl(fs, f, cmd, arg0, arg1);
    fs_unprotect(fs);
    ret
}

pub(crate) fn sys_unlink(path: *const u8) -> i32 {
    if path.is_null() {
        return -1;
    }
    let fs = match root_fs() {
        Some(fs) => fs,
        None => return -1,
    };
    let path = unsafe { util::cstr_bytes(path, FS_MOUNT_SIZE + FILE_NAME_SIZE) };

    fs_protect(fs);
    let result = match unsafe { fs.data_mut() } {
        FsData::Fat(fat) => fat.unlink(&mut DevBlock(fs.dev_id), path),
        FsData::Dev => Err(FsError::NotSupported),
    };
    fs_unprotect(fs);

    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Close everything a dying task still holds. Called from sys_exit.
pub(crate) fn close_task_files() {
    for fd in 0..TASK_OFILE_NR as i32 {
        if task::task_file(fd).is_some() {
            sys_close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching() {
        assert!(path_begin_with(b"/dev/tty0", b"/dev"));
        assert!(path_begin_with(b"/dev", b"/dev"));
        assert!(!path_begin_with(b"/de", b"/dev"));
        assert!(!path_begin_with(b"/home/a.txt", b"/dev"));
        // Zero-padded mount point buffers compare by their meaningful prefix.
        let mut mp = [0u8; 16];
        mp[..4].copy_from_slice(b"/dev");
        assert!(path_begin_with(b"/dev/tty0", &mp));
    }

    #[test]
    fn next_child_strips_the_mount_component() {
        assert_eq!(path_next_child(b"/dev/tty0"), Some(&b"tty0"[..]));
        assert_eq!(path_next_child(b"/home/a.txt"), Some(&b"a.txt"[..]));
        assert_eq!(path_next_child(b"/dev"), None);
        assert_eq!(path_next_child(b"tty0"), None);
    }

    #[test]
    fn device_numbers_parse_from_path_tails() {
        assert_eq!(path_to_num(b"0"), Some(0));
        assert_eq!(path_to_num(b"13"), Some(13));
        assert_eq!(path_to_num(b"x1"), None);
        // An empty tail is number 0 in the original's reading.
        assert_eq!(path_to_num(b""), Some(0));
    }

    #[test]
    fn dirent_layout_matches_the_user_abi() {
        use core::mem::{offset_of, size_of};
        assert_eq!(offset_of!(Dirent, index), 0);
        assert_eq!(offset_of!(Dirent, kind), 4);
        assert_eq!(offset_of!(Dirent, name), 8);
        assert_eq!(offset_of!(Dirent, size), 264);
        assert_eq!(size_of::<Dirent>(), 268);
    }

    #[test]
    fn fd_range_check() {
        assert!(is_fd_bad(-1));
        assert!(!is_fd_bad(0));
        assert!(!is_fd_bad(TASK_OFILE_NR as i32 - 1));
        assert!(is_fd_bad(TASK_OFILE_NR as i32));
    }
}
