//! In-memory literal: a file-like cursor over an owned byte buffer.
//! Backs the boot-time images and anything else that wants to treat a
//! buffer as a seekable file.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::io::{Io, IOCTL_GETLEN, IOCTL_GETPOS, IOCTL_SETPOS};

struct LitInner {
    bytes: Vec<u8>,
    pos: usize,
}

pub struct IoLit {
    inner: Mutex<LitInner>,
    writable: bool,
}

impl IoLit {
    pub fn readonly(bytes: &[u8]) -> Arc<IoLit> {
        Arc::new(IoLit {
            inner: Mutex::new(LitInner {
                bytes: Vec::from(bytes),
                pos: 0,
            }),
            writable: false,
        })
    }

    pub fn writable(bytes: Vec<u8>) -> Arc<IoLit> {
        Arc::new(IoLit {
            inner: Mutex::new(LitInner { bytes, pos: 0 }),
            writable: true,
        })
    }
}

impl Io for IoLit {
    /// Copy from the cursor onward; returns bytes transferred, 0 at EOF.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let n = buf.len().min(inner.bytes.len() - inner.pos);
        let pos = inner.pos;
        buf[..n].copy_from_slice(&inner.bytes[pos..pos + n]);
        inner.pos += n;
        Ok(n)
    }

    /// Overwrite at the cursor, growing the buffer when the span runs
    /// past the end; returns bytes transferred.
    fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::NotSup);
        }
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        let overlap = buf.len().min(inner.bytes.len().saturating_sub(pos));
        inner.bytes[pos..pos + overlap].copy_from_slice(&buf[..overlap]);
        inner.bytes.extend_from_slice(&buf[overlap..]);
        inner.pos += buf.len();
        Ok(buf.len())
    }

    fn ctl(&self, cmd: usize, arg: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        match cmd {
            IOCTL_GETLEN => Ok(inner.bytes.len()),
            IOCTL_GETPOS => Ok(inner.pos),
            IOCTL_SETPOS => {
                if arg > inner.bytes.len() {
                    return Err(Error::Inval);
                }
                inner.pos = arg;
                Ok(arg)
            }
            _ => Err(Error::NotSup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_advances_cursor_and_hits_eof() {
        let lit = IoLit::readonly(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(lit.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(lit.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(lit.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn seek_bounds() {
        let lit = IoLit::readonly(b"0123456789");
        assert_eq!(lit.ctl(IOCTL_GETLEN, 0).unwrap(), 10);
        assert_eq!(lit.ctl(IOCTL_SETPOS, 7).unwrap(), 7);
        assert_eq!(lit.ctl(IOCTL_GETPOS, 0).unwrap(), 7);
        let mut buf = [0u8; 8];
        assert_eq!(lit.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");
        // One past the end is a valid cursor; further is not.
        assert_eq!(lit.ctl(IOCTL_SETPOS, 10).unwrap(), 10);
        assert_eq!(lit.ctl(IOCTL_SETPOS, 11), Err(Error::Inval));
    }

    #[test]
    fn writes_report_bytes_transferred() {
        let lit = IoLit::writable(Vec::from(&b"xxxx"[..]));
        assert_eq!(lit.write(b"ab").unwrap(), 2);
        assert_eq!(lit.write(b"cdEF").unwrap(), 4);
        let buf = &mut [0u8; 8];
        lit.ctl(IOCTL_SETPOS, 0).unwrap();
        assert_eq!(lit.read(buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdEF");
    }

    #[test]
    fn readonly_rejects_writes() {
        let lit = IoLit::readonly(b"abc");
        assert_eq!(lit.write(b"x"), Err(Error::NotSup));
    }
}
