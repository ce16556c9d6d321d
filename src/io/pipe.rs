//! Inter-process pipe: a shared bounded byte FIFO.
//!
//! One endpoint object serves any number of readers and writers; every
//! descriptor that refers to it (across `fork`, in any process) shares
//! the same 512-byte ring. Blocking is mediated by the `not_full` /
//! `not_empty` conditions; the ring's own lock is released before a
//! waiter suspends and re-acquired on wake, so a lock holder never
//! blocks on itself.

use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::io::{Io, IOCTL_GETFILL, IOCTL_GETSPACE};
use crate::thread::Condition;

pub const PIPE_CAPACITY: usize = 512;

/// The circular buffer proper. Pure data; all blocking lives above it.
struct Ring {
    buf: [u8; PIPE_CAPACITY],
    head: usize,
    tail: usize,
    fill: usize,
}

impl Ring {
    const fn new() -> Ring {
        Ring {
            buf: [0; PIPE_CAPACITY],
            head: 0,
            tail: 0,
            fill: 0,
        }
    }

    /// Copy in up to `min(src.len(), capacity - fill)` bytes at the tail.
    fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(PIPE_CAPACITY - self.fill);
        for &b in &src[..n] {
            self.buf[self.tail] = b;
            self.tail = (self.tail + 1) % PIPE_CAPACITY;
        }
        self.fill += n;
        n
    }

    /// Copy out up to `min(dst.len(), fill)` bytes from the head.
    fn take(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.fill);
        for slot in dst[..n].iter_mut() {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % PIPE_CAPACITY;
        }
        self.fill -= n;
        n
    }
}

pub struct Pipe {
    ring: Mutex<Ring>,
    not_full: Condition,
    not_empty: Condition,
}

impl Pipe {
    pub fn new() -> Arc<Pipe> {
        Arc::new(Pipe {
            ring: Mutex::new(Ring::new()),
            not_full: Condition::new("pipe_not_full"),
            not_empty: Condition::new("pipe_not_empty"),
        })
    }
}

impl Io for Pipe {
    /// Block while the pipe is empty, then drain up to `buf.len()` bytes.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut ring = self.ring.lock();
            if ring.fill > 0 {
                let n = ring.take(buf);
                drop(ring);
                self.not_full.broadcast();
                return Ok(n);
            }
            // Release the ring and sleep in one scheduler step.
            self.not_empty.wait_then(move || drop(ring));
        }
    }

    /// Block while the pipe is full, then append up to `buf.len()` bytes.
    /// Transfers larger than the remaining space return short; callers
    /// that need full delivery loop through `iowrite`.
    fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut ring = self.ring.lock();
            if ring.fill < PIPE_CAPACITY {
                let n = ring.put(buf);
                drop(ring);
                self.not_empty.broadcast();
                return Ok(n);
            }
            self.not_full.wait_then(move || drop(ring));
        }
    }

    fn ctl(&self, cmd: usize, _arg: usize) -> Result<usize> {
        let ring = self.ring.lock();
        match cmd {
            IOCTL_GETFILL => Ok(ring.fill),
            IOCTL_GETSPACE => Ok(PIPE_CAPACITY - ring.fill),
            _ => Err(Error::NotSup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_bounds_and_fifo_order() {
        let mut ring = Ring::new();
        assert_eq!(ring.put(&[1, 2, 3]), 3);
        assert_eq!(ring.fill, 3);
        let mut out = [0u8; 2];
        assert_eq!(ring.take(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(ring.fill, 1);
        let mut rest = [0u8; 8];
        assert_eq!(ring.take(&mut rest), 1);
        assert_eq!(rest[0], 3);
        assert_eq!(ring.take(&mut rest), 0);
    }

    #[test]
    fn ring_refuses_overfill() {
        let mut ring = Ring::new();
        let big = [7u8; PIPE_CAPACITY + 100];
        assert_eq!(ring.put(&big), PIPE_CAPACITY);
        assert_eq!(ring.fill, PIPE_CAPACITY);
        assert_eq!(ring.put(&[1]), 0);
        assert!(ring.head < PIPE_CAPACITY && ring.tail < PIPE_CAPACITY);
    }

    #[test]
    fn ring_wraps_around() {
        let mut ring = Ring::new();
        // Walk the indices most of the way around the buffer, then
        // straddle the wrap point.
        let chunk = [0xAB; 300];
        let mut sink = [0u8; 300];
        assert_eq!(ring.put(&chunk), 300);
        assert_eq!(ring.take(&mut sink), 300);
        let pattern: alloc::vec::Vec<u8> = (0..=255u8).collect();
        assert_eq!(ring.put(&pattern), 256);
        let mut out = [0u8; 256];
        assert_eq!(ring.take(&mut out), 256);
        assert_eq!(&out[..], &pattern[..]);
        assert!(ring.head < PIPE_CAPACITY && ring.tail < PIPE_CAPACITY);
    }

    #[test]
    fn round_trip_within_capacity() {
        let mut ring = Ring::new();
        let msg: alloc::vec::Vec<u8> = (0..PIPE_CAPACITY as u32).map(|i| i as u8).collect();
        assert_eq!(ring.put(&msg), PIPE_CAPACITY);
        let mut out = alloc::vec![0u8; PIPE_CAPACITY];
        assert_eq!(ring.take(&mut out), PIPE_CAPACITY);
        assert_eq!(out, msg);
    }

    #[test]
    fn ctl_reports_fill_and_space() {
        let pipe = Pipe::new();
        pipe.ring.lock().put(&[0u8; 100]);
        assert_eq!(pipe.ctl(IOCTL_GETFILL, 0).unwrap(), 100);
        assert_eq!(pipe.ctl(IOCTL_GETSPACE, 0).unwrap(), PIPE_CAPACITY - 100);
        assert_eq!(pipe.ctl(999, 0), Err(Error::NotSup));
    }
}
