//! `btsnoop2pcap` entry point
//!
//! Converts a btsnoop capture into a pcap file readable by Wireshark.

use clap::Parser;
use slip_snoop_lib::cli::ConvertArgs;

fn main() -> anyhow::Result<()> {
    let args = ConvertArgs::parse();
    slip_snoop_lib::init_logging();
    slip_snoop_lib::run_convert(&args)
}
