//! The JTAG module keeps a software replica of the IEEE 1149.1 TAP state
//! machine, buffers TMS/TDI bits, and formats them into the board's byte
//! command frames which are exchanged with the Port module. TDO reply bytes
//! are unpacked back into BitStreams.

use num_enum::IntoPrimitive;
use thiserror::Error;
use crate::bits::BitStream;
use crate::port::{self, Port, Severity, DEFAULT_TIMEOUT};

#[derive(Error, Debug)]
pub enum Error {
    #[error("port error")]
    Port(#[from] port::Error),
    #[error("TMS/TDI buffers not empty at start of operation.")]
    DirtyBuffers,
    #[error("TAP is in {0}, expected Shift-DR or Shift-IR.")]
    NotInShiftState(TapState),
    #[error("TAP state is unknown; reset the TAP first.")]
    UnknownState,
    #[error("no single TMS transition from {from} to {to}.")]
    UnreachableState { from: TapState, to: TapState },
    #[error("mismatched TMS ({tms}) and TDI ({tdi}) bit counts.")]
    MismatchedBuffers { tms: usize, tdi: usize },
    #[error("bad echo from run-test command: expected {expected:#04x}, got {actual:#04x}.")]
    BadEcho { expected: u8, actual: u8 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::Port(e) => e.severity(),
            Error::BadEcho { .. } => Severity::Major,
            _ => Severity::Fatal,
        }
    }
}

/// Single-byte command opcodes understood by the board.
#[derive(Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum Command {
    RunTest = 0x47,
    Jtag = 0x4F,
}

/// `Command::Jtag` flag bits.
const GET_TDO: u8 = 0x01;
const PUT_TMS: u8 = 0x02;
const TMS_VAL: u8 = 0x04;
const PUT_TDI: u8 = 0x08;
#[allow(unused)]
const TDI_VAL: u8 = 0x10;

/// Number of bytes in the run-test echo reply.
const RUNTEST_ECHO_LEN: usize = 5;

/// States of the IEEE 1149.1 TAP controller, plus a sentinel for the
/// state before the first reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TapState {
    Invalid = 0,
    TestLogicReset = 1,
    RunTestIdle = 2,
    SelectDrScan = 3,
    SelectIrScan = 4,
    CaptureDr = 5,
    CaptureIr = 6,
    ShiftDr = 7,
    ShiftIr = 8,
    Exit1Dr = 9,
    Exit1Ir = 10,
    PauseDr = 11,
    PauseIr = 12,
    Exit2Dr = 13,
    Exit2Ir = 14,
    UpdateDr = 15,
    UpdateIr = 16,
}

/// TAP transition table: `NEXT_TAP_STATE[current][tms]`.
const NEXT_TAP_STATE: [[TapState; 2]; 17] = {
    use TapState::*;
    [
        // TMS=0          TMS=1              CURRENT STATE
        [Invalid,        Invalid],         // Invalid
        [RunTestIdle,    TestLogicReset],  // TestLogicReset
        [RunTestIdle,    SelectDrScan],    // RunTestIdle
        [CaptureDr,      SelectIrScan],    // SelectDrScan
        [CaptureIr,      TestLogicReset],  // SelectIrScan
        [ShiftDr,        Exit1Dr],         // CaptureDr
        [ShiftIr,        Exit1Ir],         // CaptureIr
        [ShiftDr,        Exit1Dr],         // ShiftDr
        [ShiftIr,        Exit1Ir],         // ShiftIr
        [PauseDr,        UpdateDr],        // Exit1Dr
        [PauseIr,        UpdateIr],        // Exit1Ir
        [PauseDr,        Exit2Dr],         // PauseDr
        [PauseIr,        Exit2Ir],         // PauseIr
        [ShiftDr,        UpdateDr],        // Exit2Dr
        [ShiftIr,        UpdateIr],        // Exit2Ir
        [RunTestIdle,    SelectDrScan],    // UpdateDr
        [RunTestIdle,    SelectDrScan],    // UpdateIr
    ]
};

impl TapState {
    /// The state reached from here by one TCK with the given TMS value.
    pub fn next(self, tms: bool) -> TapState {
        NEXT_TAP_STATE[self as usize][tms as usize]
    }

    /// True for the two states in which TCK shifts register bits.
    pub fn is_shift(self) -> bool {
        self == TapState::ShiftDr || self == TapState::ShiftIr
    }

    pub fn name(self) -> &'static str {
        match self {
            TapState::Invalid => "Invalid",
            TapState::TestLogicReset => "Test-Logic-Reset",
            TapState::RunTestIdle => "Run-Test/Idle",
            TapState::SelectDrScan => "Select-DR-Scan",
            TapState::SelectIrScan => "Select-IR-Scan",
            TapState::CaptureDr => "Capture-DR",
            TapState::CaptureIr => "Capture-IR",
            TapState::ShiftDr => "Shift-DR",
            TapState::ShiftIr => "Shift-IR",
            TapState::Exit1Dr => "Exit1-DR",
            TapState::Exit1Ir => "Exit1-IR",
            TapState::PauseDr => "Pause-DR",
            TapState::PauseIr => "Pause-IR",
            TapState::Exit2Dr => "Exit2-DR",
            TapState::Exit2Ir => "Exit2-IR",
            TapState::UpdateDr => "Update-DR",
            TapState::UpdateIr => "Update-IR",
        }
    }
}

impl std::fmt::Display for TapState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// JTAG access to one board over an exclusively-owned port.
///
/// Between public operations both bit buffers are empty; they are only
/// populated during a compose-then-flush sequence inside one operation.
pub struct JtagPort<P> {
    port: P,
    state: TapState,
    tms_bits: BitStream,
    tdi_bits: BitStream,
}

impl<P: Port> JtagPort<P> {
    pub fn new(port: P) -> JtagPort<P> {
        JtagPort {
            port,
            state: TapState::Invalid,
            tms_bits: BitStream::new(),
            tdi_bits: BitStream::new(),
        }
    }

    /// Current state of the software TAP replica.
    pub fn tap_state(&self) -> TapState {
        self.state
    }

    /// Drive the TAP to Test-Logic-Reset with five TMS=1 clocks.
    pub fn reset_tap(&mut self) -> Result<()> {
        if !self.is_buffer_empty() {
            return Err(Error::DirtyBuffers);
        }
        log::debug!("Resetting TAP");
        for _ in 0..5 {
            self.shift_tms(true);
        }
        self.flush()?;
        self.state = TapState::TestLogicReset;
        Ok(())
    }

    /// Step the TAP through each state in `states`, one TMS bit per hop.
    ///
    /// Every hop must be reachable in a single TMS transition from its
    /// predecessor. The queued TMS bits are flushed at the end.
    pub fn go_thru_states(&mut self, states: &[TapState]) -> Result<()> {
        if !self.is_buffer_empty() {
            return Err(Error::DirtyBuffers);
        }
        for &target in states {
            if self.state == TapState::Invalid {
                return Err(Error::UnknownState);
            }
            let tms = self.state.next(true) == target;
            if !tms && self.state.next(false) != target {
                return Err(Error::UnreachableState { from: self.state, to: target });
            }
            self.shift_tms(tms);
        }
        self.flush()
    }

    /// Queue `bits` for transmission on TDI, LSB end first.
    ///
    /// With `exit_shift`, one TMS=1 is sent with the final TDI bit, leaving
    /// the shift state. The TAP must be in Shift-DR or Shift-IR.
    pub fn shift_tdi(&mut self, bits: &BitStream, exit_shift: bool, do_flush: bool) -> Result<()> {
        // TMS must not change until all TDI bits are sent.
        if !self.tms_bits.is_empty() {
            return Err(Error::DirtyBuffers);
        }
        if !self.state.is_shift() {
            return Err(Error::NotInShiftState(self.state));
        }
        self.tdi_bits.append(bits);
        if exit_shift {
            self.shift_tms(true);
        }
        if do_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Retrieve `num_bits` TDO bits from the board, appending them to `out`.
    ///
    /// With `exit_shift`, the final bit is captured while leaving the shift
    /// state (static TMS=1). The TAP must be in Shift-DR or Shift-IR and
    /// the bit buffers already transmitted.
    pub fn shift_tdo(&mut self, num_bits: usize, out: &mut BitStream, exit_shift: bool) -> Result<()> {
        if !self.is_buffer_empty() {
            return Err(Error::DirtyBuffers);
        }
        if !self.state.is_shift() {
            return Err(Error::NotInShiftState(self.state));
        }
        if num_bits == 0 {
            return Ok(());
        }
        if exit_shift {
            // Gather all but the last bit while still in the shift state.
            if num_bits > 1 {
                self.shift_tdo(num_bits - 1, out, false)?;
            }
            // Move our state replica out of the shift state, but drive the
            // pin with the static-TMS flag rather than a queued bit.
            self.shift_tms(true);
            self.tms_bits.clear();
            self.port.write(&jtag_cmd_header(1, GET_TDO | TMS_VAL), DEFAULT_TIMEOUT)?;
            let reply = self.port.read(1, DEFAULT_TIMEOUT)?;
            out.push_back((reply[0] & 1) as u64, 1);
        } else {
            self.port.write(&jtag_cmd_header(num_bits, GET_TDO), DEFAULT_TIMEOUT)?;
            let reply = self.port.read((num_bits + 7) / 8, DEFAULT_TIMEOUT)?;
            out.push_back_bytes(&reply, num_bits);
        }
        Ok(())
    }

    /// Pulse TCK `num_tcks` times and verify the board's echo.
    pub fn run_test(&mut self, num_tcks: u32) -> Result<()> {
        log::debug!("Running test for {} TCK pulses", num_tcks);
        let mut cmd = vec![Command::RunTest.into()];
        cmd.extend_from_slice(&num_tcks.to_le_bytes());
        self.port.write(&cmd, DEFAULT_TIMEOUT)?;
        let echo = self.port.read(RUNTEST_ECHO_LEN, DEFAULT_TIMEOUT)?;
        let expected: u8 = Command::RunTest.into();
        if echo[0] != expected {
            log::error!("Run-test echo {:#04x} does not match command {:#04x}", echo[0], expected);
            return Err(Error::BadEcho { expected, actual: echo[0] });
        }
        Ok(())
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        Ok(self.port.close()?)
    }

    fn is_buffer_empty(&self) -> bool {
        self.tms_bits.is_empty() && self.tdi_bits.is_empty()
    }

    /// Queue one TMS bit and update the state replica in lock-step.
    fn shift_tms(&mut self, bit: bool) {
        self.tms_bits.push_back_bit(bit);
        self.state = self.state.next(bit);
    }

    /// Transmit the queued TMS and TDI bits as one or two command frames.
    ///
    /// Equal-length buffers are byte-interleaved (TMS even, TDI odd). A
    /// single trailing TMS bit is split off and sent as a one-bit combined
    /// frame after the leading pure-TDI bits. Any other length mismatch is
    /// unsupported; the buffers are discarded and a fatal error returned.
    fn flush(&mut self) -> Result<()> {
        debug_assert!(!self.is_buffer_empty());
        let mut frame;
        if self.tdi_bits.is_empty() {
            frame = jtag_cmd_header(self.tms_bits.len(), PUT_TMS);
            frame.extend_from_slice(&self.tms_bits.to_bytes());
        } else if self.tms_bits.is_empty() {
            frame = jtag_cmd_header(self.tdi_bits.len(), PUT_TDI);
            frame.extend_from_slice(&self.tdi_bits.to_bytes());
        } else if self.tms_bits.len() == self.tdi_bits.len() {
            frame = jtag_cmd_header(self.tdi_bits.len(), PUT_TMS | PUT_TDI);
            for (tms, tdi) in self.tms_bits.to_bytes().iter().zip(self.tdi_bits.to_bytes()) {
                frame.push(*tms);
                frame.push(tdi);
            }
        } else if self.tms_bits.len() == 1 {
            // One TMS bit alongside many TDI bits: send the leading TDI
            // bits alone, then the trailing TMS+TDI pair together.
            let last_tms = self.tms_bits.back(1) != 0;
            let last_tdi = self.tdi_bits.back(1) != 0;
            self.tms_bits.pop_back(1);
            self.tdi_bits.pop_back(1);
            self.flush()?;
            self.tms_bits.push_back_bit(last_tms);
            self.tdi_bits.push_back_bit(last_tdi);
            return self.flush();
        } else {
            let (tms, tdi) = (self.tms_bits.len(), self.tdi_bits.len());
            log::error!("Cannot flush {} TMS bits against {} TDI bits", tms, tdi);
            self.tms_bits.clear();
            self.tdi_bits.clear();
            return Err(Error::MismatchedBuffers { tms, tdi });
        }
        self.tms_bits.clear();
        self.tdi_bits.clear();
        Ok(self.port.write(&frame, DEFAULT_TIMEOUT)?)
    }
}

#[cfg(test)]
impl<P> JtagPort<P> {
    pub(crate) fn port(&self) -> &P {
        &self.port
    }

    pub(crate) fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

/// First six bytes of a `JTAG_CMD` frame: opcode, 32-bit little-endian bit
/// count, flags.
fn jtag_cmd_header(num_bits: usize, flags: u8) -> Vec<u8> {
    let mut header = vec![Command::Jtag.into()];
    header.extend_from_slice(&(num_bits as u32).to_le_bytes());
    header.push(flags);
    header
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;
    use std::time::Duration;
    use crate::port::{Error, Port, Result};

    /// Scripted stand-in for the USB port: records every frame written and
    /// serves pre-queued reply bytes.
    #[derive(Default)]
    pub struct MockPort {
        pub written: Vec<Vec<u8>>,
        pub replies: VecDeque<Vec<u8>>,
        pub opened: bool,
    }

    impl MockPort {
        pub fn new() -> MockPort {
            MockPort::default()
        }

        pub fn queue_reply(&mut self, bytes: Vec<u8>) {
            self.replies.push_back(bytes);
        }
    }

    impl Port for MockPort {
        fn open(&mut self, _retries: u32) -> Result<()> {
            self.opened = true;
            Ok(())
        }

        fn read(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            let reply = self.replies.pop_front().ok_or(Error::Timeout)?;
            if reply.len() < len {
                return Err(Error::ShortRead { expected: len, actual: reply.len() });
            }
            Ok(reply[..len].to_vec())
        }

        fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
            self.written.push(data.to_vec());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.opened = false;
            Ok(())
        }
    }
}

#[cfg(test)]
use testutil::MockPort;

#[cfg(test)]
fn tap_at_shift_dr() -> JtagPort<MockPort> {
    let mut tap = JtagPort::new(MockPort::new());
    tap.reset_tap().unwrap();
    tap.go_thru_states(&[
        TapState::RunTestIdle,
        TapState::SelectDrScan,
        TapState::CaptureDr,
        TapState::ShiftDr,
    ]).unwrap();
    tap.port.written.clear();
    tap
}

#[test]
fn test_tap_table() {
    use TapState::*;
    let expected = [
        (Invalid, Invalid, Invalid),
        (TestLogicReset, RunTestIdle, TestLogicReset),
        (RunTestIdle, RunTestIdle, SelectDrScan),
        (SelectDrScan, CaptureDr, SelectIrScan),
        (SelectIrScan, CaptureIr, TestLogicReset),
        (CaptureDr, ShiftDr, Exit1Dr),
        (CaptureIr, ShiftIr, Exit1Ir),
        (ShiftDr, ShiftDr, Exit1Dr),
        (ShiftIr, ShiftIr, Exit1Ir),
        (Exit1Dr, PauseDr, UpdateDr),
        (Exit1Ir, PauseIr, UpdateIr),
        (PauseDr, PauseDr, Exit2Dr),
        (PauseIr, PauseIr, Exit2Ir),
        (Exit2Dr, ShiftDr, UpdateDr),
        (Exit2Ir, ShiftIr, UpdateIr),
        (UpdateDr, RunTestIdle, SelectDrScan),
        (UpdateIr, RunTestIdle, SelectDrScan),
    ];
    assert_eq!(expected.len(), NEXT_TAP_STATE.len());
    for &(state, tms0, tms1) in expected.iter() {
        assert_eq!(state.next(false), tms0, "{} with TMS=0", state);
        assert_eq!(state.next(true), tms1, "{} with TMS=1", state);
    }
}

#[test]
fn test_five_ones_reach_reset() {
    use TapState::*;
    let states = [
        TestLogicReset, RunTestIdle, SelectDrScan, SelectIrScan, CaptureDr, CaptureIr,
        ShiftDr, ShiftIr, Exit1Dr, Exit1Ir, PauseDr, PauseIr, Exit2Dr, Exit2Ir,
        UpdateDr, UpdateIr,
    ];
    for &start in states.iter() {
        let mut state = start;
        for _ in 0..5 {
            state = state.next(true);
        }
        assert_eq!(state, TestLogicReset, "from {}", start);
    }
}

#[test]
fn test_reset_tap_frame() {
    let mut tap = JtagPort::new(MockPort::new());
    tap.reset_tap().unwrap();
    assert_eq!(tap.port.written, vec![vec![0x4F, 5, 0, 0, 0, PUT_TMS, 0x1F]]);
    assert_eq!(tap.tap_state(), TapState::TestLogicReset);
    assert!(tap.is_buffer_empty());
}

#[test]
fn test_go_thru_states_frame() {
    let mut tap = JtagPort::new(MockPort::new());
    tap.reset_tap().unwrap();
    tap.go_thru_states(&[
        TapState::RunTestIdle,
        TapState::SelectDrScan,
        TapState::SelectIrScan,
        TapState::CaptureIr,
        TapState::ShiftIr,
    ]).unwrap();
    // TMS bits 0, 1, 1, 0, 0 packed LSB-first.
    assert_eq!(tap.port.written[1], vec![0x4F, 5, 0, 0, 0, PUT_TMS, 0x06]);
    assert_eq!(tap.tap_state(), TapState::ShiftIr);
    assert!(tap.is_buffer_empty());
}

#[test]
fn test_go_thru_states_unreachable() {
    let mut tap = JtagPort::new(MockPort::new());
    tap.reset_tap().unwrap();
    match tap.go_thru_states(&[TapState::CaptureDr]) {
        Err(Error::UnreachableState { from, to }) => {
            assert_eq!(from, TapState::TestLogicReset);
            assert_eq!(to, TapState::CaptureDr);
        }
        other => panic!("expected UnreachableState, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_shift_tdi_exit_frames() {
    let mut tap = JtagPort::new(MockPort::new());
    tap.reset_tap().unwrap();
    tap.go_thru_states(&[
        TapState::RunTestIdle,
        TapState::SelectDrScan,
        TapState::SelectIrScan,
        TapState::CaptureIr,
        TapState::ShiftIr,
    ]).unwrap();
    tap.port.written.clear();

    let user1: BitStream = "000010".parse().unwrap();
    tap.shift_tdi(&user1, true, true).unwrap();

    // Five leading TDI bits alone, then the final TMS+TDI pair interleaved.
    assert_eq!(tap.port.written, vec![
        vec![0x4F, 5, 0, 0, 0, PUT_TDI, 0x02],
        vec![0x4F, 1, 0, 0, 0, PUT_TMS | PUT_TDI, 0x01, 0x00],
    ]);
    assert_eq!(tap.tap_state(), TapState::Exit1Ir);
    assert!(tap.is_buffer_empty());
}

#[test]
fn test_shift_tdi_outside_shift_state() {
    let mut tap = JtagPort::new(MockPort::new());
    tap.reset_tap().unwrap();
    let bits = BitStream::from_word(0b1, 1);
    match tap.shift_tdi(&bits, false, true) {
        Err(Error::NotInShiftState(state)) => assert_eq!(state, TapState::TestLogicReset),
        other => panic!("expected NotInShiftState, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_interleaved_flush() {
    // Equal-length multi-byte TMS and TDI buffers interleave with TMS
    // bytes at even payload positions and TDI bytes at odd positions.
    let mut tap = tap_at_shift_dr();
    tap.tms_bits.push_back(0x2CA, 10);
    tap.tdi_bits.push_back(0x135, 10);
    tap.flush().unwrap();
    assert_eq!(tap.port.written, vec![
        vec![0x4F, 10, 0, 0, 0, PUT_TMS | PUT_TDI, 0xCA, 0x35, 0x02, 0x01],
    ]);
    assert!(tap.is_buffer_empty());
}

#[test]
fn test_mismatched_flush_discards_buffers() {
    let mut tap = tap_at_shift_dr();
    tap.tms_bits.push_back(0b11, 2);
    tap.tdi_bits.push_back(0b11111, 5);
    match tap.flush() {
        Err(Error::MismatchedBuffers { tms, tdi }) => {
            assert_eq!((tms, tdi), (2, 5));
        }
        other => panic!("expected MismatchedBuffers, got {:?}", other.map(|_| ())),
    }
    assert!(tap.is_buffer_empty());
}

#[test]
fn test_shift_tdo() {
    let mut tap = tap_at_shift_dr();
    tap.port.queue_reply(vec![0xAB, 0x05]);
    let mut out = BitStream::new();
    tap.shift_tdo(12, &mut out, false).unwrap();
    assert_eq!(tap.port.written, vec![vec![0x4F, 12, 0, 0, 0, GET_TDO]]);
    assert_eq!(out.len(), 12);
    assert_eq!(out.to_u64(), 0x5AB);
    assert_eq!(tap.tap_state(), TapState::ShiftDr);
}

#[test]
fn test_shift_tdo_exit() {
    let mut tap = tap_at_shift_dr();
    tap.port.queue_reply(vec![0b101]);
    tap.port.queue_reply(vec![0x01]);
    let mut out = BitStream::new();
    tap.shift_tdo(4, &mut out, true).unwrap();
    assert_eq!(tap.port.written, vec![
        vec![0x4F, 3, 0, 0, 0, GET_TDO],
        vec![0x4F, 1, 0, 0, 0, GET_TDO | TMS_VAL],
    ]);
    assert_eq!(out.to_u64(), 0b1101);
    assert_eq!(tap.tap_state(), TapState::Exit1Dr);
    assert!(tap.is_buffer_empty());
}

#[test]
fn test_short_tdo_read_leaves_buffers_empty() {
    let mut tap = tap_at_shift_dr();
    tap.port.queue_reply(vec![0xFF]);
    let mut out = BitStream::new();
    match tap.shift_tdo(16, &mut out, false) {
        Err(Error::Port(port::Error::ShortRead { expected, actual })) => {
            assert_eq!((expected, actual), (2, 1));
        }
        other => panic!("expected ShortRead, got {:?}", other.map(|_| ())),
    }
    assert!(tap.is_buffer_empty());

    // The port object stays usable for a retry.
    tap.port.queue_reply(vec![0x12, 0x34]);
    tap.shift_tdo(16, &mut out, false).unwrap();
    assert_eq!(out.to_u64(), 0x3412);
}

#[test]
fn test_run_test() {
    let mut tap = JtagPort::new(MockPort::new());
    tap.port.queue_reply(vec![0x47, 0, 0, 0, 0]);
    tap.run_test(100).unwrap();
    assert_eq!(tap.port.written, vec![vec![0x47, 100, 0, 0, 0]]);

    tap.port.queue_reply(vec![0x42, 0, 0, 0, 0]);
    match tap.run_test(1) {
        Err(e @ Error::BadEcho { .. }) => assert_eq!(e.severity(), Severity::Major),
        other => panic!("expected BadEcho, got {:?}", other.map(|_| ())),
    }
}
