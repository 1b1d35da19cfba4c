// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! xsio
//!
//! Host-side I/O with soft modules inside XESS FPGA boards, carried over
//! the XSUSB JTAG bridge.

pub mod bits;
pub mod port;
pub mod jtag;
pub mod hostio;
pub mod mem;
pub mod dut;
