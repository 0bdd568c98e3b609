//! The system calls that move data through user memory.
//!
//! The system call number and its arguments are 32-bit words on the user
//! stack, starting at the stack pointer saved by the trap.

use super::process::Process;
use crate::fs::FileDescriptor;
use crate::mem::{
    mmap::MapId,
    user::{pin_user_buffer, read_user_u32},
    vm_error::VmError,
};
use alloc::string::String;
use kidneyvm_shared::mem::{pg_ofs, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, info, warn};

pub const SYS_EXIT: usize = 1;
pub const SYS_READ: usize = 8;
pub const SYS_WRITE: usize = 9;
pub const SYS_MMAP: usize = 13;
pub const SYS_MUNMAP: usize = 14;

const STDOUT_FILENO: FileDescriptor = 1;

/// Runs the system call whose frame starts at `esp`. Returns the value for
/// the caller's `eax`. A process that passes a bad pointer is terminated with
/// status -1, and -1 is returned.
pub fn handler(process: &Process, esp: usize) -> i32 {
    process.set_user_esp(esp);
    match dispatch(process, esp) {
        Ok(ret) => ret,
        Err(e) => {
            if e.is_fatal() {
                e.halt();
            }
            warn!("{}: killed by system call: {}", process.name(), e);
            process.exit(-1);
            -1
        }
    }
}

/// Reinterprets a 32-bit stack word as the signed value the caller pushed.
fn signed(word: u32) -> i32 {
    i32::from_le_bytes(word.to_le_bytes())
}

/// Byte counts are returned in `eax`, so they saturate at `i32::MAX`.
fn byte_count(total: usize) -> i32 {
    i32::try_from(total).unwrap_or(i32::MAX)
}

fn dispatch(process: &Process, esp: usize) -> Result<i32, VmError> {
    let arg = |n: usize| -> Result<u32, VmError> {
        let ptr = esp.checked_add(4 * n).ok_or(VmError::BadAddress)?;
        read_user_u32(process.system(), process.spt(), ptr)
    };

    match arg(0)? as usize {
        SYS_EXIT => {
            let status = signed(arg(1)?);
            process.exit(status);
            Ok(status)
        }
        SYS_READ => read(process, signed(arg(1)?), arg(2)? as usize, arg(3)? as usize),
        SYS_WRITE => write(process, signed(arg(1)?), arg(2)? as usize, arg(3)? as usize),
        SYS_MMAP => Ok(mmap(process, signed(arg(1)?), arg(2)? as usize)),
        SYS_MUNMAP => munmap(process, signed(arg(1)?)),
        number => {
            debug!("{}: unsupported system call {}", process.name(), number);
            Ok(-1)
        }
    }
}

fn check_range(buf: usize, size: usize) -> Result<(), VmError> {
    match buf.checked_add(size) {
        Some(end) if end <= OFFSET => Ok(()),
        _ => Err(VmError::BadAddress),
    }
}

/// Whether every page of `[buf, buf + size)` can be pinned at once.
fn fits_in_pool(process: &Process, buf: usize, size: usize) -> bool {
    let pages = (pg_ofs(buf) + size).div_ceil(PAGE_FRAME_SIZE);
    pages <= process.system().pool.total_frames()
}

/// The whole buffer is pinned before the filesystem lock is taken, so no
/// page fault or eviction happens while the lock is held.
fn read(process: &Process, fd: FileDescriptor, buf: usize, size: usize) -> Result<i32, VmError> {
    check_range(buf, size)?;
    let Some(file) = process.file(fd) else {
        return Ok(-1);
    };
    if !fits_in_pool(process, buf, size) {
        return Ok(-1);
    }

    let sys = process.system();
    let buffer = pin_user_buffer(sys, process.spt(), buf, size, true)?;
    let _fs = sys.filesys_lock.acquire(process.tid());
    let mut bytes = alloc::vec![0; size];
    let n = file.read(&mut bytes);
    let copied = buffer.copy_out(&bytes[..n])?;
    Ok(byte_count(copied))
}

fn write(process: &Process, fd: FileDescriptor, buf: usize, size: usize) -> Result<i32, VmError> {
    check_range(buf, size)?;
    let file = match fd {
        STDOUT_FILENO => None,
        fd => match process.file(fd) {
            Some(file) => Some(file),
            None => return Ok(-1),
        },
    };
    if !fits_in_pool(process, buf, size) {
        return Ok(-1);
    }

    let sys = process.system();
    let buffer = pin_user_buffer(sys, process.spt(), buf, size, false)?;
    let _fs = sys.filesys_lock.acquire(process.tid());
    let bytes = buffer.copy_in()?;
    let written = match &file {
        Some(file) => file.write(&bytes),
        None => {
            info!("{}: {}", process.name(), String::from_utf8_lossy(&bytes));
            bytes.len()
        }
    };
    Ok(byte_count(written))
}

fn mmap(process: &Process, fd: FileDescriptor, addr: usize) -> i32 {
    let Some(file) = process.file(fd) else {
        return -1;
    };
    process
        .spt()
        .mmap(process.system(), &file, addr)
        .unwrap_or(-1)
}

fn munmap(process: &Process, mapid: MapId) -> Result<i32, VmError> {
    match process.spt().munmap(process.system(), mapid) {
        Ok(()) => Ok(0),
        Err(VmError::InvalidMapping) => Ok(-1),
        Err(e) => Err(e),
    }
}
