//! This is the lowest-level module. It is responsible for scanning the USB
//! bus to find an XSUSB-protocol device, and reading and writing its vendor
//! bulk endpoint pair. The OUT endpoint carries command frames to the board;
//! the IN endpoint (the same number with bit 7 set) carries replies.

use std::time::Duration;
use thiserror::Error;
use rusb::{Context, DeviceHandle, UsbContext};

/// USB vendor ID of XSUSB-protocol boards.
pub const XSUSB_VID: u16 = 0x04D8;
/// USB product ID of XSUSB-protocol boards.
pub const XSUSB_PID: u16 = 0xFF8C;
/// Default bulk endpoint number.
pub const XSUSB_ENDPOINT: u8 = 1;

/// Default timeout applied to each bulk transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
/// Hard ceiling on any single transfer timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(20);

/// How badly an operation failed.
///
/// `Minor` failures are transient I/O conditions the caller may retry.
/// `Major` failures mean the device broke protocol but the session can
/// continue. `Fatal` failures are contract violations; the request is
/// abandoned and the error propagates to the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Minor,
    Major,
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("no device {vid:04x}:{pid:04x} instance {instance} found.")]
    NotFound { vid: u16, pid: u16, instance: u32 },
    #[error("device interface already claimed elsewhere.")]
    Busy,
    #[error("could not open device.")]
    OpenFailed,
    #[error("port is not open.")]
    NotOpen,
    #[error("transfer timed out.")]
    Timeout,
    #[error("short read: requested {expected} bytes, received {actual}.")]
    ShortRead { expected: usize, actual: usize },
    #[error("short write: submitted {expected} bytes, delivered {actual}.")]
    ShortWrite { expected: usize, actual: usize },
    #[error("USB error")]
    Usb(#[from] rusb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::NotFound { .. } => Severity::Minor,
            Error::Busy => Severity::Minor,
            Error::OpenFailed => Severity::Minor,
            Error::Timeout => Severity::Minor,
            Error::ShortRead { .. } => Severity::Major,
            Error::ShortWrite { .. } => Severity::Major,
            Error::Usb(_) => Severity::Major,
            Error::NotOpen => Severity::Fatal,
            Error::Other(_) => Severity::Fatal,
        }
    }
}

/// A byte-stream port to a device.
///
/// `UsbPort` is the production implementation; tests substitute scripted
/// doubles. A port is constructed closed, and `close` is idempotent.
pub trait Port {
    /// Open the port, attempting up to `retries` times.
    fn open(&mut self, retries: u32) -> Result<()>;

    /// Read exactly `len` bytes, waiting up to `timeout` for them.
    fn read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Write all of `data`, waiting up to `timeout`.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Release the device. Safe to call repeatedly.
    fn close(&mut self) -> Result<()>;
}

/// Bulk-endpoint port to one instance of a `(vid, pid)` USB device.
pub struct UsbPort {
    vid: u16,
    pid: u16,
    instance: u32,
    endpoint: u8,
    handle: Option<DeviceHandle<Context>>,
}

impl UsbPort {
    /// Create a closed port bound to the `instance`-th device matching
    /// `(vid, pid)`, using bulk endpoint `endpoint` for output and
    /// `endpoint | 0x80` for input.
    pub fn new(vid: u16, pid: u16, instance: u32, endpoint: u8) -> UsbPort {
        UsbPort { vid, pid, instance, endpoint, handle: None }
    }

    /// Create a closed port bound to an XSUSB board.
    pub fn xsusb(instance: u32) -> UsbPort {
        UsbPort::new(XSUSB_VID, XSUSB_PID, instance, XSUSB_ENDPOINT)
    }

    /// Count attached devices matching `(vid, pid)`.
    pub fn count(vid: u16, pid: u16) -> Result<usize> {
        let context = Context::new()?;
        let mut count = 0;
        for device in context.devices()?.iter() {
            match device.device_descriptor() {
                Ok(desc) if desc.vendor_id() == vid && desc.product_id() == pid => count += 1,
                _ => continue,
            }
        }
        Ok(count)
    }

    fn out_ep(&self) -> u8 {
        self.endpoint
    }

    fn in_ep(&self) -> u8 {
        self.endpoint | 0x80
    }

    /// Locate our instance on the bus and open a handle to it.
    fn find_and_open(&self) -> Result<DeviceHandle<Context>> {
        let context = Context::new()?;
        let mut instance = 0;
        for device in context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if desc.vendor_id() != self.vid || desc.product_id() != self.pid {
                continue;
            }
            if instance < self.instance {
                instance += 1;
                continue;
            }
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(rusb::Error::Busy) => return Err(Error::Busy),
                Err(_) => return Err(Error::OpenFailed),
            };
            // The boards expose a single configuration; make sure it is
            // the active one before any endpoint traffic.
            match handle.set_active_configuration(1) {
                Ok(()) | Err(rusb::Error::Busy) => (),
                Err(_) => return Err(Error::OpenFailed),
            }
            log::debug!("Opened device {:04x}:{:04x} instance {}",
                        self.vid, self.pid, self.instance);
            return Ok(handle);
        }
        Err(Error::NotFound { vid: self.vid, pid: self.pid, instance: self.instance })
    }
}

impl Port for UsbPort {
    fn open(&mut self, retries: u32) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let mut last = Error::OpenFailed;
        for _ in 0..retries.max(1) {
            match self.find_and_open() {
                Ok(handle) => {
                    self.handle = Some(handle);
                    return Ok(());
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    fn read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        assert!(len > 0, "zero-length read");
        assert!(timeout < MAX_TIMEOUT, "transfer timeout out of range");
        let in_ep = self.in_ep();
        let handle = self.handle.as_ref().ok_or(Error::NotOpen)?;
        let _claim = ClaimGuard::claim(handle)?;
        let mut buf = vec![0u8; len];
        let n = match handle.read_bulk(in_ep, &mut buf, timeout) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => return Err(Error::Timeout),
            Err(e) => return Err(e.into()),
        };
        if n < len {
            return Err(Error::ShortRead { expected: len, actual: n });
        }
        buf.truncate(n);
        log::trace!("RX: {:02X?}", buf);
        Ok(buf)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        assert!(!data.is_empty(), "zero-length write");
        assert!(timeout < MAX_TIMEOUT, "transfer timeout out of range");
        let out_ep = self.out_ep();
        let handle = self.handle.as_ref().ok_or(Error::NotOpen)?;
        log::trace!("TX: {:02X?}", data);
        let _claim = ClaimGuard::claim(handle)?;
        let n = match handle.write_bulk(out_ep, data, timeout) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => return Err(Error::Timeout),
            Err(e) => return Err(e.into()),
        };
        if n < data.len() {
            return Err(Error::ShortWrite { expected: data.len(), actual: n });
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            log::debug!("Closed device {:04x}:{:04x} instance {}",
                        self.vid, self.pid, self.instance);
        }
        Ok(())
    }
}

impl Drop for UsbPort {
    fn drop(&mut self) {
        self.close().ok();
    }
}

/// Claims interface 0 for the duration of one transfer and releases it on
/// every exit path.
struct ClaimGuard<'a> {
    handle: &'a DeviceHandle<Context>,
}

impl<'a> ClaimGuard<'a> {
    fn claim(handle: &'a DeviceHandle<Context>) -> Result<ClaimGuard<'a>> {
        match handle.claim_interface(0) {
            Ok(()) => Ok(ClaimGuard { handle }),
            Err(rusb::Error::Busy) => Err(Error::Busy),
            Err(e) => Err(e.into()),
        }
    }
}

impl<'a> Drop for ClaimGuard<'a> {
    fn drop(&mut self) {
        self.handle.release_interface(0).ok();
    }
}

#[test]
fn test_severity_order() {
    assert!(Severity::Minor < Severity::Major);
    assert!(Severity::Major < Severity::Fatal);
}

#[test]
fn test_severity_classes() {
    let e = Error::NotFound { vid: XSUSB_VID, pid: XSUSB_PID, instance: 0 };
    assert_eq!(e.severity(), Severity::Minor);
    assert_eq!(Error::Timeout.severity(), Severity::Minor);
    assert_eq!(Error::ShortRead { expected: 6, actual: 2 }.severity(), Severity::Major);
    assert_eq!(Error::NotOpen.severity(), Severity::Fatal);
}
