//! `slip-snoop` capture entry point
//!
//! Reads SLIP-framed HCI traffic from a serial port and writes btsnoop files.

use clap::Parser;
use slip_snoop_lib::cli::CaptureArgs;

fn main() -> anyhow::Result<()> {
    let args = CaptureArgs::parse();
    slip_snoop_lib::init_logging();
    slip_snoop_lib::run_capture(&args)
}
