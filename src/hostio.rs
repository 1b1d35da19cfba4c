//! The HostIo module multiplexes several logical modules in the FPGA
//! fabric behind a single JTAG USER data-register scan. It loads the USER
//! instruction once, then frames every transaction as
//! `payload | length | module-id` on TDI and harvests reply bits of known
//! length from TDO, never leaving Shift-DR in between.

use thiserror::Error;
use crate::bits::BitStream;
use crate::jtag::{self, JtagPort, TapState};
use crate::port::{Port, Severity};

#[derive(Error, Debug)]
pub enum Error {
    #[error("JTAG error")]
    Jtag(#[from] jtag::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::Jtag(e) => e.severity(),
            Error::Other(_) => Severity::Fatal,
        }
    }
}

/// Width of the module-id field trailing every command.
pub const ID_FIELD_LEN: usize = 8;
/// Width of the payload-plus-result bit-count field.
pub const LEN_FIELD_LEN: usize = 32;

/// The USER1 instruction opcode on Xilinx 7-series and similar parts.
pub const DEFAULT_USER_INSTR: u64 = 0b000010;
pub const DEFAULT_USER_INSTR_LEN: usize = 6;

/// Shared HostIO session over a JTAG port.
pub struct HostIo<P> {
    jtag: JtagPort<P>,
    user_instr: BitStream,
}

impl<P: Port> HostIo<P> {
    /// Create a session using the default USER1 instruction.
    pub fn new(jtag: JtagPort<P>) -> HostIo<P> {
        HostIo {
            jtag,
            user_instr: BitStream::from_word(DEFAULT_USER_INSTR, DEFAULT_USER_INSTR_LEN),
        }
    }

    /// Replace the USER instruction loaded by [`reset`](Self::reset).
    ///
    /// The length is whatever the target device's IR expects; it is not
    /// fixed by this layer.
    pub fn set_user_instr(&mut self, user_instr: BitStream) {
        self.user_instr = user_instr;
    }

    /// Reset the TAP, load the USER instruction, and park in Shift-DR.
    ///
    /// All subsequent commands run inside Shift-DR with the user data
    /// register addressed; nothing here ever exits that state again.
    pub fn reset(&mut self) -> Result<()> {
        log::debug!("Resetting HostIO link, USER instruction {}", self.user_instr);
        let user_instr = self.user_instr.clone();
        self.jtag.reset_tap()?;
        self.jtag.go_thru_states(&[
            TapState::RunTestIdle,
            TapState::SelectDrScan,
            TapState::SelectIrScan,
            TapState::CaptureIr,
            TapState::ShiftIr,
        ])?;
        self.jtag.shift_tdi(&user_instr, true, true)?;
        self.jtag.go_thru_states(&[
            TapState::UpdateIr,
            TapState::SelectDrScan,
            TapState::CaptureDr,
            TapState::ShiftDr,
        ])?;
        Ok(())
    }

    /// Send `payload` to module `id` and collect `num_result_bits` of reply.
    ///
    /// The TDI line carries the payload first, then the 32-bit total of
    /// payload and result bits, then the 8-bit id, which the module decodes
    /// from the trailing end.
    pub fn cmd(&mut self, id: &BitStream, payload: &BitStream, num_result_bits: usize)
        -> Result<BitStream>
    {
        let len_field = BitStream::from_word(
            (payload.len() + num_result_bits) as u64,
            LEN_FIELD_LEN,
        );
        let frame = payload.clone() + len_field + id;
        self.jtag.shift_tdi(&frame, false, true)?;

        let mut results = BitStream::new();
        if num_result_bits > 0 {
            self.jtag.shift_tdo(num_result_bits, &mut results, false)?;
        }
        Ok(results)
    }

    /// Pulse TCK on the target, leaving the HostIO link untouched.
    pub fn run_test(&mut self, num_tcks: u32) -> Result<()> {
        Ok(self.jtag.run_test(num_tcks)?)
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        Ok(self.jtag.close()?)
    }
}

#[cfg(test)]
impl<P> HostIo<P> {
    pub(crate) fn port(&self) -> &P {
        self.jtag.port()
    }

    pub(crate) fn port_mut(&mut self) -> &mut P {
        self.jtag.port_mut()
    }
}

#[cfg(test)]
use crate::jtag::testutil::MockPort;

#[cfg(test)]
pub(crate) fn hostio_on_mock() -> HostIo<MockPort> {
    let mut hostio = HostIo::new(JtagPort::new(MockPort::new()));
    hostio.reset().unwrap();
    hostio
}

#[test]
fn test_reset_parks_in_shift_dr() {
    let hostio = hostio_on_mock();
    assert_eq!(hostio.jtag.tap_state(), TapState::ShiftDr);
    // Reset: TMS frame, walk to Shift-IR, USER instruction (two frames),
    // walk to Shift-DR.
    assert_eq!(hostio.jtag.port().written.len(), 5);
}

#[test]
fn test_cmd_frame_layout() {
    // An 8-bit address 0x05 with the 2-bit read opcode, expecting 48 reply
    // bits from module 2: 50 TDI bits whose back 8 bits are the id and
    // whose middle 32 bits hold 10 + 48.
    let mut hostio = hostio_on_mock();
    hostio.jtag.port_mut().written.clear();
    hostio.jtag.port_mut().replies.push_back(vec![0u8; 6]);

    let id = BitStream::from_word(0x02, ID_FIELD_LEN);
    let payload = BitStream::from_word(0x05, 8) + BitStream::from_word(0b11, 2);
    assert_eq!(payload.len(), 10);
    let results = hostio.cmd(&id, &payload, 48).unwrap();
    assert_eq!(results.len(), 48);

    let written = hostio.jtag.port().written.clone();
    assert_eq!(written.len(), 2);

    // 50 bits of TDI data in one frame.
    assert_eq!(&written[0][..6], &[0x4F, 50, 0, 0, 0, 0x08]);
    let mut frame = BitStream::new();
    frame.push_back_bytes(&written[0][6..], 50);
    assert_eq!(frame.back(8), 0x02);
    assert_eq!(frame.slice(10, 42).to_u64(), 58);
    assert_eq!(frame.front(8), 0x05);
    assert_eq!(frame.slice(8, 10).to_u64(), 0b11);

    // Followed by one TDO sweep of exactly 48 bits.
    assert_eq!(&written[1][..], &[0x4F, 48, 0, 0, 0, 0x01]);
}

#[test]
fn test_cmd_without_results_skips_tdo_read() {
    let mut hostio = hostio_on_mock();
    hostio.jtag.port_mut().written.clear();
    let id = BitStream::from_word(0x01, ID_FIELD_LEN);
    let payload = BitStream::from_word(0b10, 2);
    let results = hostio.cmd(&id, &payload, 0).unwrap();
    assert!(results.is_empty());
    assert_eq!(hostio.jtag.port().written.len(), 1);
}
