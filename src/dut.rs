//! This module implements the device-under-test HostIO client: it forces
//! input vectors onto a DUT module in the FPGA and reads back its outputs.

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
    #[error("tried to access the DUT before querying its parameters.")]
    NotSized,
    #[error("DUT module {id} reported zero input and output widths; module not present.")]
    NoModule { id: u8 },
    #[error("DUT reply was {actual} bits, expected {expected}.")]
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

/// Operations a DUT module can perform.
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

/// Client for a device-under-test HostIO module.
pub struct DutIo<P> {
    hostio: HostIo<P>,
    id: Option<BitStream>,
    input_width: usize,
    output_width: usize,
}

impl<P: Port> DutIo<P> {
    pub fn new(hostio: HostIo<P>) -> DutIo<P> {
        DutIo { hostio, id: None, input_width: 0, output_width: 0 }
    }

    /// Bring up the HostIO link (TAP reset, USER instruction, Shift-DR).
    pub fn reset(&mut self) -> Result<()> {
        Ok(self.hostio.reset()?)
    }

    /// Query the DUT for its input and output vector widths, binding
    /// `module_id`.
    pub fn get_size(&mut self, module_id: u8) -> Result<(usize, usize)> {
        let id = BitStream::from_word(module_id as u64, ID_FIELD_LEN);
        self.id = Some(id.clone());
        let mut params = self.hostio.cmd(&id, &Opcode::Size.bits(),
                                         SIZE_RESULT_LEN + SKIP_CYCLES)?;
        params.pop_front(SKIP_CYCLES);
        self.input_width = params.front(SIZE_RESULT_LEN / 2) as usize;
        params.pop_front(SIZE_RESULT_LEN / 2);
        self.output_width = params.front(SIZE_RESULT_LEN / 2) as usize;
        log::debug!("DUT module {}: {} input bits, {} output bits",
                    module_id, self.input_width, self.output_width);
        Ok((self.input_width, self.output_width))
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn output_width(&self) -> usize {
        self.output_width
    }

    /// Read the DUT's output vector.
    pub fn read(&mut self) -> Result<BitStream> {
        let id = match &self.id {
            Some(id) => id.clone(),
            None => return Err(Error::NotSized),
        };
        let num_result_bits = self.output_width + SKIP_CYCLES;
        let mut result = self.hostio.cmd(&id, &Opcode::Read.bits(), num_result_bits)?;
        result.pop_front(SKIP_CYCLES);
        if result.len() != self.output_width {
            return Err(Error::WrongReplyLength {
                expected: self.output_width,
                actual: result.len(),
            });
        }
        Ok(result)
    }

    /// Force `vector` onto the DUT's inputs. No reply is expected.
    pub fn write(&mut self, vector: &BitStream) -> Result<()> {
        assert!(!vector.is_empty(), "input vector must not be empty");
        let id = match &self.id {
            Some(id) => id.clone(),
            None => return Err(Error::NotSized),
        };
        if vector.len() != self.input_width {
            log::warn!("Input vector is {} bits, DUT expects {}",
                       vector.len(), self.input_width);
        }
        let payload = vector.clone() + Opcode::Write.bits();
        self.hostio.cmd(&id, &payload, 0)?;
        Ok(())
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        Ok(self.hostio.close()?)
    }
}

impl DutIo<UsbPort> {
    /// Open a DUT session over the `usb_instance`-th attached board.
    ///
    /// Performs USB bring-up, the HostIO reset, and the size handshake.
    /// A module reporting zero input and output widths does not exist.
    pub fn open_usb(usb_instance: u32, module_id: u8) -> Result<DutIo<UsbPort>> {
        let mut port = UsbPort::xsusb(usb_instance);
        port.open(1)?;
        let mut dut = DutIo::new(HostIo::new(JtagPort::new(port)));
        dut.reset()?;
        let (input_width, output_width) = dut.get_size(module_id)?;
        if input_width == 0 && output_width == 0 {
            return Err(Error::NoModule { id: module_id });
        }
        Ok(dut)
    }
}

#[cfg(test)]
use crate::hostio::hostio_on_mock;

/// Queue a size reply of `input_width` and `output_width` and run `get_size`.
#[cfg(test)]
fn sized_dut(input_width: u64, output_width: u64) -> DutIo<crate::jtag::testutil::MockPort> {
    let mut dut = DutIo::new(hostio_on_mock());
    let mut reply = BitStream::new();
    reply.push_back(0, SKIP_CYCLES);
    reply.push_back(input_width, 8);
    reply.push_back(output_width, 8);
    dut.hostio.port_mut().queue_reply(reply.to_bytes());
    let widths = dut.get_size(3).unwrap();
    assert_eq!(widths, (input_width as usize, output_width as usize));
    dut.hostio.port_mut().written.clear();
    dut
}

#[test]
fn test_get_size() {
    let dut = sized_dut(4, 2);
    assert_eq!(dut.input_width(), 4);
    assert_eq!(dut.output_width(), 2);
}

#[test]
fn test_access_before_get_size_is_fatal() {
    let mut dut = DutIo::new(hostio_on_mock());
    match dut.read() {
        Err(e @ Error::NotSized) => {
            assert_eq!(e.severity(), Severity::Fatal);
            assert!(e.to_string().contains("querying its parameters"));
        }
        other => panic!("expected NotSized, got {:?}", other),
    }
}

#[test]
fn test_write_frame() {
    let mut dut = sized_dut(4, 2);
    dut.write(&"1011".parse().unwrap()).unwrap();

    // 4 vector bits, 2 opcode bits, 32 length bits, 8 id bits.
    let written = dut.hostio.port().written.clone();
    assert_eq!(written.len(), 1);
    assert_eq!(&written[0][..6], &[0x4F, 46, 0, 0, 0, 0x08]);
    let mut frame = BitStream::new();
    frame.push_back_bytes(&written[0][6..], 46);
    assert_eq!(frame.front(4), 0b1011);
    assert_eq!(frame.slice(4, 6).to_u64(), 0b10);
    assert_eq!(frame.slice(6, 38).to_u64(), 6);
    assert_eq!(frame.back(8), 0x03);
}

#[test]
fn test_write_then_read() {
    let mut dut = sized_dut(4, 2);
    dut.write(&"1011".parse().unwrap()).unwrap();
    dut.hostio.port_mut().queue_reply(vec![0b110]);
    let outputs = dut.read().unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs.to_u64(), 0b11);

    // Each write is independent and each read returns exactly two bits.
    dut.write(&"0100".parse().unwrap()).unwrap();
    dut.hostio.port_mut().queue_reply(vec![0b010]);
    let outputs = dut.read().unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs.to_u64(), 0b01);
}
