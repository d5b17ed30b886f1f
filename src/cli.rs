//! Command-line argument definitions for both binaries.

use clap::Parser;
use std::path::PathBuf;

use crate::btsnoop::{TimestampEpoch, DATALINK_HCI_UART, DEFAULT_MAX_RECORD_LEN};
use crate::capture::{CaptureConfig, CaptureMode};
use crate::convert::{default_output_path, ConvertOptions};
use crate::pcap::PcapLinkType;
use crate::slip::{EscapePolicy, DEFAULT_MAX_FRAME_LEN};

/// Version string with git hash and build time
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BUILD_GIT_HASH"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

/// Capture SLIP-framed HCI traffic from a serial port into btsnoop files.
#[derive(Parser, Debug)]
#[command(name = "slip-snoop")]
#[command(author, version = LONG_VERSION, about, long_about = None)]
pub struct CaptureArgs {
    /// Serial device to read from
    #[arg(short = 't', long = "tty", value_name = "TTY")]
    pub tty: PathBuf,

    /// Serial baud rate
    #[arg(short = 'b', long = "baudrate", default_value_t = 115_200)]
    pub baudrate: u32,

    /// Output file (default: YYYYMMDD-HHMMSS.btsnoop)
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// How frames are written out
    #[arg(long = "mode", value_enum, default_value_t = CaptureMode::Records)]
    pub mode: CaptureMode,

    /// Handling of invalid SLIP escape sequences
    #[arg(long = "escape-policy", value_enum, default_value_t = EscapePolicy::Permissive)]
    pub escape_policy: EscapePolicy,

    /// Largest SLIP frame accepted, in bytes
    #[arg(long = "max-frame-len", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Epoch for record timestamps (records mode)
    #[arg(long = "epoch", value_enum, default_value_t = TimestampEpoch::Unix)]
    pub epoch: TimestampEpoch,

    /// Write a JSON capture summary to this path on exit
    #[arg(long = "summary", value_name = "FILE")]
    pub summary: Option<PathBuf>,
}

impl CaptureArgs {
    /// Session configuration from these arguments
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            mode: self.mode,
            escape_policy: self.escape_policy,
            max_frame_len: self.max_frame_len,
            datalink_type: DATALINK_HCI_UART,
            epoch: self.epoch,
        }
    }
}

/// Convert a btsnoop capture into a pcap file.
#[derive(Parser, Debug)]
#[command(name = "btsnoop2pcap")]
#[command(author, version = LONG_VERSION, about, long_about = None)]
pub struct ConvertArgs {
    /// btsnoop file to convert
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output file (default: INPUT with a .pcap extension)
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Epoch of the source timestamps
    #[arg(long = "epoch", value_enum, default_value_t = TimestampEpoch::Unix)]
    pub epoch: TimestampEpoch,

    /// Linktype declared in the pcap header
    #[arg(long = "linktype", value_enum, default_value_t = PcapLinkType::H4)]
    pub linktype: PcapLinkType,

    /// Largest record payload accepted, in bytes
    #[arg(long = "max-record-len", default_value_t = DEFAULT_MAX_RECORD_LEN)]
    pub max_record_len: usize,
}

impl ConvertArgs {
    /// Where the pcap file goes
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| default_output_path(&self.input))
    }

    /// Conversion options from these arguments
    pub fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            epoch: self.epoch,
            linktype: self.linktype,
            max_record_len: self.max_record_len,
        }
    }
}
