//! Test utilities for `slip-snoop`
//!
//! Synthetic HCI traffic plus in-memory stand-ins for the serial port and
//! output files, so the capture pipeline can be exercised without hardware.

pub mod fakes;
pub mod hci_generator;

pub use fakes::*;
pub use hci_generator::*;
