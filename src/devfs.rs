// /dev pseudo filesystem: maps residual paths like "tty0" onto character
// devices. There is no backing store; opening a path opens the device and
// the file object just carries the dev-id around.

use crate::constants::*;
use crate::dev;
use crate::file::{File, FileKind};
use crate::fs::{path_to_num, FsError, Stat};

struct DevfsType {
    name: &'static [u8],
    dev_major: u32,
    file_kind: FileKind,
}

/// Path prefixes this filesystem understands.
static TYPE_LIST: [DevfsType; 1] = [DevfsType {
    name: b"tty",
    dev_major: DEV_TTY,
    file_kind: FileKind::Tty,
}];

pub(crate) fn open(path: &[u8], file: &mut File) -> Result<(), FsError> {
    for ty in TYPE_LIST.iter() {
        if path.len() < ty.name.len() || &path[..ty.name.len()] != ty.name {
            continue;
        }

        let minor = path_to_num(&path[ty.name.len()..]).ok_or(FsError::InvalidPath)?;
        let dev_id = dev::dev_open(ty.dev_major, minor).ok_or(FsError::DeviceError)?;

        file.dev_id = dev_id;
        file.kind = ty.file_kind;
        file.pos = 0;
        file.size = 0;
        return Ok(());
    }

    println!("devfs: unknown device path");
    Err(FsError::NotFound)
}

pub(crate) fn read(file: &mut File, buf: &mut [u8]) -> u32 {
    let len = buf.len() as u32;
    let n = dev::dev_read(file.dev_id, file.pos, buf, len);
    if n > 0 {
        file.pos += n as u32;
        n as u32
    } else {
        0
    }
}

pub(crate) fn write(file: &mut File, buf: &[u8]) -> u32 {
    let len = buf.len() as u32;
    let n = dev::dev_write(file.dev_id, file.pos, buf, len);
    if n > 0 {
        file.pos += n as u32;
        n as u32
    } else {
        0
    }
}

pub(crate) fn close(file: &File) {
    dev::dev_close(file.dev_id);
}

pub(crate) fn seek(_file: &mut File, _offset: u32, _whence: i32) -> Result<(), FsError> {
    // Character devices have no position.
    Err(FsError::NotSupported)
}

pub(crate) fn stat(_file: &File, _st: &mut Stat) -> Result<(), FsError> {
    Ok(())
}

pub(crate) fn ioctl(file: &File, cmd: i32, arg0: u32, arg1: u32) -> i32 {
    dev::dev_control(file.dev_id, cmd, arg0, arg1)
}
