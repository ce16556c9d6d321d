use lazy_static::lazy_static;
use spin::Mutex;

/// NS16550A base on the QEMU `virt` board.
const UART0_BASE: usize = 0x1000_0000;

/// Memory-mapped NS16550A UART. Register strides are one byte.
pub struct SerialPort {
    base: usize,
}

// Register offsets.
const RBR: usize = 0; // receive buffer (read)
const THR: usize = 0; // transmit holding (write)
const IER: usize = 1; // interrupt enable
const FCR: usize = 2; // FIFO control
const LCR: usize = 3; // line control
const LSR: usize = 5; // line status

const LSR_RX_READY: u8 = 0x01;
const LSR_TX_EMPTY: u8 = 0x20;

impl SerialPort {
    pub const unsafe fn new(base: usize) -> SerialPort {
        SerialPort { base }
    }

    fn reg_write(&mut self, offset: usize, value: u8) {
        unsafe { ((self.base + offset) as *mut u8).write_volatile(value) }
    }

    fn reg_read(&mut self, offset: usize) -> u8 {
        unsafe { ((self.base + offset) as *const u8).read_volatile() }
    }

    pub fn init(&mut self) {
        // Interrupts off, 8N1, FIFOs enabled and cleared. Baud divisor is
        // left at firmware defaults; QEMU ignores it anyway.
        self.reg_write(IER, 0x00);
        self.reg_write(LCR, 0x03);
        self.reg_write(FCR, 0x07);
    }

    fn wait_for_tx_empty(&mut self) {
        while (self.reg_read(LSR) & LSR_TX_EMPTY) == 0 {}
    }

    pub fn send(&mut self, data: u8) {
        self.wait_for_tx_empty();
        self.reg_write(THR, data);
    }

    /// Non-blocking receive. The caller decides how to wait.
    pub fn try_recv(&mut self) -> Option<u8> {
        if (self.reg_read(LSR) & LSR_RX_READY) != 0 {
            Some(self.reg_read(RBR))
        } else {
            None
        }
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL0: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(UART0_BASE) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
#[cfg(target_arch = "riscv64")]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    SERIAL0.lock().write_fmt(args).expect("Printing to serial failed");
}

// Off target (host unit tests) there is no UART to talk to.
#[doc(hidden)]
#[cfg(not(target_arch = "riscv64"))]
pub fn _print(_args: ::core::fmt::Arguments) {}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::uart::_print(format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        {
            $crate::uart::_print(format_args!($($arg)*));
            $crate::uart::_print(format_args!("\n"));
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        {
            $crate::uart::_print(format_args!("[INFO] "));
            $crate::uart::_print(format_args!($($arg)*));
            $crate::uart::_print(format_args!("\n"));
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        {
            $crate::uart::_print(format_args!("[WARN] "));
            $crate::uart::_print(format_args!($($arg)*));
            $crate::uart::_print(format_args!("\n"));
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        {
            $crate::uart::_print(format_args!("[ERROR] "));
            $crate::uart::_print(format_args!($($arg)*));
            $crate::uart::_print(format_args!("\n"));
        }
    };
}

pub fn init() {
    let _ = SERIAL0.lock();
}
