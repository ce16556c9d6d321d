//! Line-discipline wrapper around another I/O object (normally the UART
//! character device): CRLF normalization on output, a minimal line
//! editor with echo on input.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::Result;
use crate::io::{Io, IoRef};

pub struct IoTerm {
    inner: IoRef,
    /// Bytes of a completed line not yet handed to a reader.
    pending: Mutex<VecDeque<u8>>,
}

impl IoTerm {
    pub fn wrap(inner: IoRef) -> Arc<IoTerm> {
        Arc::new(IoTerm {
            inner,
            pending: Mutex::new(VecDeque::new()),
        })
    }

    fn echo(&self, bytes: &[u8]) {
        let _ = self.inner.write(bytes);
    }

    /// Gather one full line from the wrapped device, echoing as we go.
    fn fill_line(&self) -> Result<()> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            if self.inner.read(&mut byte)? == 0 {
                break;
            }
            match byte[0] {
                b'\r' | b'\n' => {
                    line.push(b'\n');
                    self.echo(b"\r\n");
                    break;
                }
                // Backspace and DEL both rub out one character.
                0x08 | 0x7f => {
                    if line.pop().is_some() {
                        self.echo(b"\x08 \x08");
                    }
                }
                b => {
                    line.push(b);
                    self.echo(&[b]);
                }
            }
        }
        self.pending.lock().extend(line);
        Ok(())
    }
}

impl Io for IoTerm {
    /// Return buffered line bytes; block gathering a line when empty. At
    /// most one line is delivered per call.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.lock().is_empty() {
            self.fill_line()?;
        }
        let mut pending = self.pending.lock();
        let mut n = 0;
        while n < buf.len() {
            match pending.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                    if b == b'\n' {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(n)
    }

    /// Pass bytes through, expanding each LF to CRLF.
    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        for &b in buf {
            if b == b'\n' {
                self.inner.write(b"\r\n")?;
            } else {
                self.inner.write(&[b])?;
            }
            written += 1;
        }
        Ok(written)
    }

    fn ctl(&self, cmd: usize, arg: usize) -> Result<usize> {
        self.inner.ctl(cmd, arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    /// Scripted inner device: reads come from a queue, writes are logged.
    struct Scripted {
        input: Mutex<VecDeque<u8>>,
        output: Mutex<Vec<u8>>,
    }

    impl Scripted {
        fn new(input: &[u8]) -> Arc<Scripted> {
            Arc::new(Scripted {
                input: Mutex::new(input.iter().copied().collect()),
                output: Mutex::new(Vec::new()),
            })
        }
    }

    impl Io for Scripted {
        fn read(&self, buf: &mut [u8]) -> Result<usize> {
            match self.input.lock().pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Ok(0),
            }
        }

        fn write(&self, buf: &[u8]) -> Result<usize> {
            self.output.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn ctl(&self, _cmd: usize, _arg: usize) -> Result<usize> {
            Err(Error::NotSup)
        }
    }

    #[test]
    fn write_expands_lf_to_crlf() {
        let dev = Scripted::new(b"");
        let term = IoTerm::wrap(dev.clone());
        assert_eq!(term.write(b"hi\nyo\n").unwrap(), 6);
        assert_eq!(dev.output.lock().as_slice(), b"hi\r\nyo\r\n");
    }

    #[test]
    fn read_returns_one_edited_line() {
        // "abX<backspace>c<CR>" becomes "abc\n".
        let dev = Scripted::new(b"abX\x08c\r");
        let term = IoTerm::wrap(dev.clone());
        let mut buf = [0u8; 16];
        let n = term.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc\n");
        // Echo includes the rub-out sequence and the final newline.
        assert_eq!(dev.output.lock().as_slice(), b"abX\x08 \x08c\r\n");
    }

    #[test]
    fn short_reads_drain_the_same_line() {
        let dev = Scripted::new(b"hello\r");
        let term = IoTerm::wrap(dev);
        let mut buf = [0u8; 3];
        assert_eq!(term.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        let n = term.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"lo\n");
    }
}
