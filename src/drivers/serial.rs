//! Character-device view of the console UART.

use crate::error::Result;
use crate::io::Io;
use crate::uart::SERIAL0;

pub struct SerialChannel;

impl Io for SerialChannel {
    /// Block until at least one byte arrives, then return everything the
    /// FIFO has. Polled receive: the UART runs without an interrupt line
    /// here, so waiting means yielding the CPU.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut n = 0;
            {
                let mut serial = SERIAL0.lock();
                while n < buf.len() {
                    match serial.try_recv() {
                        Some(b) => {
                            buf[n] = b;
                            n += 1;
                        }
                        None => break,
                    }
                }
            }
            if n > 0 {
                return Ok(n);
            }
            crate::thread::yield_now();
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut serial = SERIAL0.lock();
        for &b in buf {
            serial.send(b);
        }
        Ok(buf.len())
    }
}
