//! Generic byte-oriented I/O objects.
//!
//! Every open object is an `Arc<dyn Io>` held in descriptor-table slots;
//! cloning a slot across `dup` or `fork` bumps the reference count, and
//! dropping the last clone closes the object. The capability set is
//! `{close, read, write, ctl}`; `close` is `Drop`.

pub mod lit;
pub mod pipe;
pub mod term;

use alloc::sync::Arc;

use crate::error::{Error, Result};

pub type IoRef = Arc<dyn Io>;

// `ctl` commands understood across object kinds. Device-specific
// extensions start at 64.
pub const IOCTL_GETLEN: usize = 1;
pub const IOCTL_SETPOS: usize = 2;
pub const IOCTL_GETPOS: usize = 3;
pub const IOCTL_GETBLKSZ: usize = 4;
pub const IOCTL_GETREFCNT: usize = 5;
/// Pipe: bytes currently buffered.
pub const IOCTL_GETFILL: usize = 6;
/// Pipe: remaining capacity.
pub const IOCTL_GETSPACE: usize = 7;

pub trait Io: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSup)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSup)
    }

    fn ctl(&self, _cmd: usize, _arg: usize) -> Result<usize> {
        Err(Error::NotSup)
    }
}

/// Read until `buf` is full, an error surfaces, or a zero count signals
/// EOF. Returns the number of bytes actually transferred.
pub fn ioread_full(io: &dyn Io, buf: &mut [u8]) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = io.read(&mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

/// Write until all of `buf` is transferred, an error surfaces, or a zero
/// count signals no progress.
pub fn iowrite(io: &dyn Io, buf: &[u8]) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = io.write(&buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;

    /// Hands out data in fixed-size nibbles to exercise the full-transfer
    /// loops.
    struct Chunky {
        data: Mutex<(alloc::vec::Vec<u8>, usize)>,
        chunk: usize,
    }

    impl Io for Chunky {
        fn read(&self, buf: &mut [u8]) -> Result<usize> {
            let mut state = self.data.lock();
            let (ref data, ref mut pos) = *state;
            let n = self.chunk.min(buf.len()).min(data.len() - *pos);
            buf[..n].copy_from_slice(&data[*pos..*pos + n]);
            *pos += n;
            Ok(n)
        }

        fn write(&self, buf: &[u8]) -> Result<usize> {
            let mut state = self.data.lock();
            let n = self.chunk.min(buf.len());
            state.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    #[test]
    fn ioread_full_loops_until_eof() {
        let io = Chunky {
            data: Mutex::new(((0..100u8).collect(), 0)),
            chunk: 7,
        };
        let mut buf = [0u8; 64];
        assert_eq!(ioread_full(&io, &mut buf).unwrap(), 64);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[63], 63);
        // Drain the remainder; EOF stops the loop short.
        let mut rest = [0u8; 64];
        assert_eq!(ioread_full(&io, &mut rest).unwrap(), 36);
    }

    #[test]
    fn iowrite_loops_until_done() {
        let io = Chunky {
            data: Mutex::new((alloc::vec::Vec::new(), 0)),
            chunk: 5,
        };
        let msg = [9u8; 23];
        assert_eq!(iowrite(&io, &msg).unwrap(), 23);
        assert_eq!(io.data.lock().0.len(), 23);
    }
}
