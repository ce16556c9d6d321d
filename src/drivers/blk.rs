//! RAM-backed block device over a fixed physical window. The boot
//! protocol preloads the file-system image there (QEMU: `-device
//! loader,addr=0x84000000,file=...`).

use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::io::{Io, IOCTL_GETBLKSZ, IOCTL_GETLEN, IOCTL_GETPOS, IOCTL_SETPOS};

pub const RAMDISK_BASE: usize = 0x8400_0000;
pub const RAMDISK_SIZE: usize = 4 * 1024 * 1024;
pub const BLOCK_SIZE: usize = 512;

pub struct RamDisk {
    base: usize,
    size: usize,
    pos: Mutex<usize>,
}

impl RamDisk {
    pub fn new() -> Arc<RamDisk> {
        Arc::new(RamDisk {
            base: RAMDISK_BASE,
            size: RAMDISK_SIZE,
            pos: Mutex::new(0),
        })
    }
}

impl Io for RamDisk {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.pos.lock();
        let n = buf.len().min(self.size - *pos);
        unsafe {
            core::ptr::copy_nonoverlapping((self.base + *pos) as *const u8, buf.as_mut_ptr(), n);
        }
        *pos += n;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut pos = self.pos.lock();
        let n = buf.len().min(self.size - *pos);
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), (self.base + *pos) as *mut u8, n);
        }
        *pos += n;
        Ok(n)
    }

    fn ctl(&self, cmd: usize, arg: usize) -> Result<usize> {
        match cmd {
            IOCTL_GETLEN => Ok(self.size),
            IOCTL_GETBLKSZ => Ok(BLOCK_SIZE),
            IOCTL_GETPOS => Ok(*self.pos.lock()),
            IOCTL_SETPOS => {
                if arg > self.size {
                    return Err(Error::Inval);
                }
                *self.pos.lock() = arg;
                Ok(arg)
            }
            _ => Err(Error::NotSup),
        }
    }
}
