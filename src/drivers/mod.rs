pub mod blk;
pub mod serial;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::io::{term::IoTerm, Io, IoRef};

#[derive(Clone, Copy)]
enum DeviceKind {
    /// Raw UART bytes.
    Serial,
    /// UART behind the line discipline.
    Console,
    /// RAM-backed block device.
    Block,
}

struct Device {
    name: &'static str,
    instno: usize,
    kind: DeviceKind,
    /// Live handle, if currently open. Exclusive-open is enforced by
    /// checking whether any descriptor still holds the object.
    open: Option<Weak<dyn Io>>,
}

lazy_static! {
    static ref DEVICES: Mutex<Vec<Device>> = Mutex::new(Vec::new());
}

fn register(name: &'static str, instno: usize, kind: DeviceKind) {
    DEVICES.lock().push(Device {
        name,
        instno,
        kind,
        open: None,
    });
}

/// Look up a registered device and hand out its I/O object. A device
/// still referenced by any descriptor table reports `Busy`.
pub fn open(name: &str, instno: usize) -> Result<IoRef> {
    let mut devices = DEVICES.lock();
    let dev = devices
        .iter_mut()
        .find(|d| d.name == name && d.instno == instno)
        .ok_or(Error::Inval)?;
    if let Some(held) = &dev.open {
        if held.upgrade().is_some() {
            return Err(Error::Busy);
        }
    }
    let io: IoRef = match dev.kind {
        DeviceKind::Serial => Arc::new(serial::SerialChannel),
        DeviceKind::Console => IoTerm::wrap(Arc::new(serial::SerialChannel)),
        DeviceKind::Block => blk::RamDisk::new(),
    };
    dev.open = Some(Arc::downgrade(&io));
    Ok(io)
}

pub fn init() {
    register("ser", 0, DeviceKind::Serial);
    register("cons", 0, DeviceKind::Console);
    register("blk", 0, DeviceKind::Block);
    crate::log_info!("Device registry initialized (ser0, cons0, blk0).");
}
