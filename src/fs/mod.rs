//! Read-only sequential-file image.
//!
//! The image starts with an 8-byte header (`magic`, file count), followed
//! by fixed 32-byte directory entries (24-byte NUL-padded name, byte
//! offset, byte length) and the file data. It mounts over any seekable
//! I/O object: the RAM block device at boot, an in-memory literal in
//! tests.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::io::{ioread_full, Io, IoRef, IOCTL_GETBLKSZ, IOCTL_GETLEN, IOCTL_GETPOS, IOCTL_SETPOS};

const FS_MAGIC: u32 = u32::from_le_bytes(*b"iofs");
const NAME_MAX: usize = 24;
const DIRENT_SIZE: usize = 32;
const HEADER_SIZE: usize = 8;

struct DirEntry {
    name: String,
    offset: usize,
    len: usize,
}

pub struct FileSystem {
    /// Backing device; the lock serializes the seek-then-read protocol.
    backing: Mutex<IoRef>,
    entries: Vec<DirEntry>,
}

impl FileSystem {
    /// Parse the image header and directory from `io`.
    pub fn mount(io: IoRef) -> Result<Arc<FileSystem>> {
        io.ctl(IOCTL_SETPOS, 0)?;
        let mut header = [0u8; HEADER_SIZE];
        if ioread_full(&*io, &mut header)? != HEADER_SIZE {
            return Err(Error::Io);
        }
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let count = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if magic != FS_MAGIC {
            return Err(Error::Io);
        }

        let mut directory = vec![0u8; count * DIRENT_SIZE];
        if ioread_full(&*io, &mut directory)? != directory.len() {
            return Err(Error::Io);
        }
        let backing_len = io.ctl(IOCTL_GETLEN, 0)?;

        let mut entries = Vec::with_capacity(count);
        for raw in directory.chunks_exact(DIRENT_SIZE) {
            let name_len = raw[..NAME_MAX].iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
            let name = core::str::from_utf8(&raw[..name_len])
                .map_err(|_| Error::Io)?
                .into();
            let offset = u32::from_le_bytes(raw[24..28].try_into().unwrap()) as usize;
            let len = u32::from_le_bytes(raw[28..32].try_into().unwrap()) as usize;
            if offset + len > backing_len {
                return Err(Error::Io);
            }
            entries.push(DirEntry { name, offset, len });
        }

        crate::log_info!("Mounted image with {} file(s).", entries.len());
        Ok(Arc::new(FileSystem {
            backing: Mutex::new(io),
            entries,
        }))
    }

    /// Open a named file as an independent cursor object.
    pub fn open(self: &Arc<Self>, name: &str) -> Result<IoRef> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or(Error::Inval)?;
        Ok(Arc::new(FsFile {
            start: entry.offset,
            len: entry.len,
            pos: Mutex::new(0),
            fs: self.clone(),
        }))
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let backing = self.backing.lock();
        backing.ctl(IOCTL_SETPOS, offset)?;
        ioread_full(&**backing, buf)
    }

    fn block_size(&self) -> Result<usize> {
        self.backing.lock().ctl(IOCTL_GETBLKSZ, 0)
    }
}

/// One open file: a `(start, len)` extent plus a private cursor. All
/// opens share the backing device under the file system's lock.
pub struct FsFile {
    start: usize,
    len: usize,
    pos: Mutex<usize>,
    fs: Arc<FileSystem>,
}

impl Io for FsFile {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.pos.lock();
        let n = buf.len().min(self.len - *pos);
        if n == 0 {
            return Ok(0);
        }
        let got = self.fs.read_at(self.start + *pos, &mut buf[..n])?;
        *pos += got;
        Ok(got)
    }

    fn ctl(&self, cmd: usize, arg: usize) -> Result<usize> {
        match cmd {
            IOCTL_GETLEN => Ok(self.len),
            IOCTL_GETPOS => Ok(*self.pos.lock()),
            IOCTL_SETPOS => {
                if arg > self.len {
                    return Err(Error::Inval);
                }
                *self.pos.lock() = arg;
                Ok(arg)
            }
            IOCTL_GETBLKSZ => self.fs.block_size(),
            _ => Err(Error::NotSup),
        }
    }
}

lazy_static! {
    static ref ROOT: Mutex<Option<Arc<FileSystem>>> = Mutex::new(None);
}

/// Mount the boot image as the root file system.
pub fn init(backing: IoRef) -> Result<()> {
    let fs = FileSystem::mount(backing)?;
    *ROOT.lock() = Some(fs);
    Ok(())
}

/// Open a file on the root file system.
pub fn open(name: &str) -> Result<IoRef> {
    let root = ROOT.lock();
    root.as_ref().ok_or(Error::Io)?.open(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lit::IoLit;

    fn build_image(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(&FS_MAGIC.to_le_bytes());
        image.extend_from_slice(&(files.len() as u32).to_le_bytes());
        let mut offset = HEADER_SIZE + files.len() * DIRENT_SIZE;
        for (name, data) in files {
            let mut entry = [0u8; DIRENT_SIZE];
            entry[..name.len()].copy_from_slice(name.as_bytes());
            entry[24..28].copy_from_slice(&(offset as u32).to_le_bytes());
            entry[28..32].copy_from_slice(&(data.len() as u32).to_le_bytes());
            image.extend_from_slice(&entry);
            offset += data.len();
        }
        for (_, data) in files {
            image.extend_from_slice(data);
        }
        image
    }

    #[test]
    fn mount_and_read_back() {
        let image = build_image(&[("ioctl.txt", b"hello image"), ("init", &[0x7f, b'E'])]);
        let fs = FileSystem::mount(IoLit::readonly(&image)).unwrap();
        let file = fs.open("ioctl.txt").unwrap();
        assert_eq!(file.ctl(IOCTL_GETLEN, 0).unwrap(), 11);
        let mut buf = [0u8; 32];
        assert_eq!(ioread_full(&*file, &mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello image");
    }

    #[test]
    fn independent_cursors() {
        let image = build_image(&[("f", b"abcdef")]);
        let fs = FileSystem::mount(IoLit::readonly(&image)).unwrap();
        let a = fs.open("f").unwrap();
        let b = fs.open("f").unwrap();
        let mut buf = [0u8; 3];
        a.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        b.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        a.read(&mut buf).unwrap();
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn missing_file_and_bad_magic() {
        let image = build_image(&[("f", b"x")]);
        let fs = FileSystem::mount(IoLit::readonly(&image)).unwrap();
        assert!(fs.open("nope").is_err());

        let mut bad = image.clone();
        bad[0] ^= 0xff;
        assert!(FileSystem::mount(IoLit::readonly(&bad)).is_err());
    }

    #[test]
    fn truncated_extent_rejected() {
        let mut image = build_image(&[("f", b"0123456789")]);
        image.truncate(image.len() - 4);
        assert!(FileSystem::mount(IoLit::readonly(&image)).is_err());
    }
}
