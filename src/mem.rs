//! This module implements the memory-mapped HostIO client: a read/write
//! channel to RAM-like circuitry in the FPGA, addressed by module id.

use num_enum::IntoPrimitive;
use thiserror::Error;
use crate::bits::BitStream;
use crate::hostio::{self, HostIo, ID_FIELD_LEN};
use crate::jtag::JtagPort;
use crate::port::{self, Port, Severity, UsbPort};

#[derive(Error, Debug)]
pub enum Error {
    #[error("HostIO error")]
    HostIo(#[from] hostio::Error),
    #[error("port error")]
    Port(#[from] port::Error),
    #[error("tried to access memory before querying its parameters.")]
    NotSized,
    #[error("memory module {id} reported zero address or data width; module not present.")]
    NoModule { id: u8 },
    #[error("memory reply was {actual} bits, expected {expected}.")]
    WrongReplyLength { expected: usize, actual: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::HostIo(e) => e.severity(),
            Error::Port(e) => e.severity(),
            Error::WrongReplyLength { .. } => Severity::Major,
            Error::NotSized => Severity::Fatal,
            Error::NoModule { .. } => Severity::Fatal,
            Error::Other(_) => Severity::Fatal,
        }
    }
}

/// Operations a memory module can perform.
#[derive(Copy, Clone, IntoPrimitive)]
#[allow(unused)]
#[repr(u8)]
enum Opcode {
    Nop = 0b00,
    Size = 0b01,
    Write = 0b10,
    Read = 0b11,
}

const OPCODE_LEN: usize = 2;

impl Opcode {
    fn bits(self) -> BitStream {
        BitStream::from_word(u8::from(self) as u64, OPCODE_LEN)
    }
}

/// Length of the reply to a size query: two 8-bit widths.
const SIZE_RESULT_LEN: usize = 16;
/// Leading reply bits consumed by the device pipeline.
const SKIP_CYCLES: usize = 1;

/// Client for a memory-mapped HostIO module.
///
/// `get_size` must complete before any read or write; it binds the module
/// id and discovers the address and data widths used to frame every
/// subsequent transfer.
pub struct MemoryIo<P> {
    hostio: HostIo<P>,
    id: Option<BitStream>,
    addr_width: usize,
    data_width: usize,
}

impl<P: Port> MemoryIo<P> {
    pub fn new(hostio: HostIo<P>) -> MemoryIo<P> {
        MemoryIo { hostio, id: None, addr_width: 0, data_width: 0 }
    }

    /// Bring up the HostIO link (TAP reset, USER instruction, Shift-DR).
    pub fn reset(&mut self) -> Result<()> {
        Ok(self.hostio.reset()?)
    }

    /// Query the module for its address and data widths, binding `module_id`.
    pub fn get_size(&mut self, module_id: u8) -> Result<(usize, usize)> {
        let id = BitStream::from_word(module_id as u64, ID_FIELD_LEN);
        self.id = Some(id.clone());
        let mut params = self.hostio.cmd(&id, &Opcode::Size.bits(),
                                         SIZE_RESULT_LEN + SKIP_CYCLES)?;
        params.pop_front(SKIP_CYCLES);
        self.addr_width = params.front(SIZE_RESULT_LEN / 2) as usize;
        params.pop_front(SIZE_RESULT_LEN / 2);
        self.data_width = params.front(SIZE_RESULT_LEN / 2) as usize;
        log::debug!("Memory module {}: {} address bits, {} data bits",
                    module_id, self.addr_width, self.data_width);
        Ok((self.addr_width, self.data_width))
    }

    pub fn addr_width(&self) -> usize {
        self.addr_width
    }

    pub fn data_width(&self) -> usize {
        self.data_width
    }

    /// Read `num_values` words from sequential addresses starting at `addr`.
    pub fn read(&mut self, addr: u64, num_values: usize) -> Result<Vec<u64>> {
        assert!(num_values > 0, "must read at least one value");
        let id = match &self.id {
            Some(id) => id.clone(),
            None => return Err(Error::NotSized),
        };
        let payload = BitStream::from_word(addr, self.addr_width) + Opcode::Read.bits();
        let num_result_bits = self.data_width * (num_values + 1);
        let mut reply = self.hostio.cmd(&id, &payload, num_result_bits)?;
        if reply.len() != num_result_bits {
            return Err(Error::WrongReplyLength {
                expected: num_result_bits,
                actual: reply.len(),
            });
        }
        // The first word out is garbage from the device pipeline.
        reply.pop_front(self.data_width);
        let mut values = Vec::with_capacity(num_values);
        for _ in 0..num_values {
            values.push(reply.front(self.data_width));
            reply.pop_front(self.data_width);
        }
        Ok(values)
    }

    /// Read a single word from `addr`.
    pub fn read_one(&mut self, addr: u64) -> Result<u64> {
        Ok(self.read(addr, 1)?[0])
    }

    /// Write `values` to sequential addresses starting at `addr`.
    ///
    /// No reply is expected from the module.
    pub fn write(&mut self, addr: u64, values: &[u64]) -> Result<()> {
        assert!(!values.is_empty(), "must write at least one value");
        let id = match &self.id {
            Some(id) => id.clone(),
            None => return Err(Error::NotSized),
        };
        let mut payload = BitStream::new();
        for &value in values {
            payload.push_back(value, self.data_width);
        }
        let payload = payload
            + BitStream::from_word(addr, self.addr_width)
            + Opcode::Write.bits();
        self.hostio.cmd(&id, &payload, 0)?;
        Ok(())
    }

    /// Write a single word to `addr`.
    pub fn write_one(&mut self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &[value])
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        Ok(self.hostio.close()?)
    }
}

impl MemoryIo<UsbPort> {
    /// Open a memory session over the `usb_instance`-th attached board.
    ///
    /// Performs USB bring-up, the HostIO reset, and the size handshake.
    /// A module reporting a zero address or data width does not exist.
    pub fn open_usb(usb_instance: u32, module_id: u8) -> Result<MemoryIo<UsbPort>> {
        let mut port = UsbPort::xsusb(usb_instance);
        port.open(1)?;
        let mut mem = MemoryIo::new(HostIo::new(JtagPort::new(port)));
        mem.reset()?;
        let (addr_width, data_width) = mem.get_size(module_id)?;
        if addr_width == 0 || data_width == 0 {
            return Err(Error::NoModule { id: module_id });
        }
        Ok(mem)
    }
}

#[cfg(test)]
use crate::hostio::hostio_on_mock;

/// Queue a size reply of `addr_width` and `data_width` and run `get_size`.
#[cfg(test)]
fn sized_mem(addr_width: u64, data_width: u64) -> MemoryIo<crate::jtag::testutil::MockPort> {
    let mut mem = MemoryIo::new(hostio_on_mock());
    let mut reply = BitStream::new();
    reply.push_back(0, SKIP_CYCLES);
    reply.push_back(addr_width, 8);
    reply.push_back(data_width, 8);
    mem.hostio.port_mut().queue_reply(reply.to_bytes());
    let widths = mem.get_size(2).unwrap();
    assert_eq!(widths, (addr_width as usize, data_width as usize));
    mem.hostio.port_mut().written.clear();
    mem
}

#[test]
fn test_get_size() {
    let mem = sized_mem(8, 16);
    assert_eq!(mem.addr_width(), 8);
    assert_eq!(mem.data_width(), 16);
}

#[test]
fn test_access_before_get_size_is_fatal() {
    let mut mem = MemoryIo::new(hostio_on_mock());
    match mem.read(0, 1) {
        Err(e @ Error::NotSized) => {
            assert_eq!(e.severity(), Severity::Fatal);
            assert!(e.to_string().contains("querying its parameters"));
        }
        other => panic!("expected NotSized, got {:?}", other),
    }
    match mem.write(0, &[1]) {
        Err(Error::NotSized) => (),
        other => panic!("expected NotSized, got {:?}", other),
    }
}

#[test]
fn test_read_frame_and_reply() {
    let mut mem = sized_mem(8, 16);

    // Two words from address 5: the reply carries one pipeline word then
    // the values in ascending address order.
    let mut reply = BitStream::new();
    reply.push_back(0xDEAD, 16);
    reply.push_back(0x1234, 16);
    reply.push_back(0x5678, 16);
    mem.hostio.port_mut().queue_reply(reply.to_bytes());

    let values = mem.read(0x05, 2).unwrap();
    assert_eq!(values, vec![0x1234, 0x5678]);

    // 10 payload bits + 32 length bits + 8 id bits in the TDI frame, with
    // the length field holding 10 + 48 = 58.
    let written = mem.hostio.port().written.clone();
    assert_eq!(&written[0][..6], &[0x4F, 50, 0, 0, 0, 0x08]);
    let mut frame = BitStream::new();
    frame.push_back_bytes(&written[0][6..], 50);
    assert_eq!(frame.front(8), 0x05);
    assert_eq!(frame.slice(8, 10).to_u64(), 0b11);
    assert_eq!(frame.slice(10, 42).to_u64(), 58);
    assert_eq!(frame.back(8), 0x02);
    assert_eq!(&written[1][..], &[0x4F, 48, 0, 0, 0, 0x01]);
}

#[test]
fn test_write_frame() {
    let mut mem = sized_mem(8, 16);
    mem.write(0x10, &[0x0001, 0x0045, 0xCAFE]).unwrap();

    // 48 value bits, 8 address bits, 2 opcode bits, then length and id.
    let written = mem.hostio.port().written.clone();
    assert_eq!(written.len(), 1);
    assert_eq!(&written[0][..6], &[0x4F, 98, 0, 0, 0, 0x08]);
    let mut frame = BitStream::new();
    frame.push_back_bytes(&written[0][6..], 98);
    assert_eq!(frame.slice(0, 16).to_u64(), 0x0001);
    assert_eq!(frame.slice(16, 32).to_u64(), 0x0045);
    assert_eq!(frame.slice(32, 48).to_u64(), 0xCAFE);
    assert_eq!(frame.slice(48, 56).to_u64(), 0x10);
    assert_eq!(frame.slice(56, 58).to_u64(), 0b10);
    assert_eq!(frame.slice(58, 90).to_u64(), 58);
    assert_eq!(frame.back(8), 0x02);
}

#[test]
fn test_write_read_round_trip() {
    let values = [0x0001u64, 0x0045, 0xCAFE];
    let mut mem = sized_mem(8, 16);
    mem.write(0x10, &values).unwrap();

    // Echo back exactly the value bits the write frame carried, behind one
    // pipeline word, the way the hardware replays the stored words.
    let frame = mem.hostio.port().written[0].clone();
    let mut stored = BitStream::new();
    stored.push_back_bytes(&frame[6..], 48);
    let mut reply = BitStream::from_word(0xFFFF, 16);
    reply.append(&stored);
    mem.hostio.port_mut().queue_reply(reply.to_bytes());

    assert_eq!(mem.read(0x10, 3).unwrap(), values);
}

#[test]
fn test_read_one() {
    let mut mem = sized_mem(4, 8);
    let mut reply = BitStream::new();
    reply.push_back(0xFF, 8);
    reply.push_back(0x42, 8);
    mem.hostio.port_mut().queue_reply(reply.to_bytes());
    assert_eq!(mem.read_one(0x3).unwrap(), 0x42);
}
