//! `slip-snoop` - Bluetooth HCI capture over a SLIP serial link
//!
//! A device running a btsnoop-over-UART logger sends its HCI traffic
//! SLIP-framed over a serial port. This crate de-frames that stream into
//! btsnoop files and converts btsnoop captures into pcap for Wireshark.
//!
//! # Modules
//!
//! - [`slip`]: streaming SLIP decoder and encoder
//! - [`btsnoop`]: btsnoop file format, writer and record parser
//! - [`pcap`]: pcap file format and btsnoop-to-pcap record conversion
//! - [`capture`]: the capture session driving source, decoder and sinks
//! - [`convert`]: whole-file btsnoop-to-pcap conversion

use anyhow::Context;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub mod btsnoop;
pub mod capture;
pub mod cli;
pub mod convert;
pub mod interrupt;
pub mod output;
pub mod pcap;
pub mod slip;
pub mod source;
pub mod test_utils;

use capture::CaptureSession;
use cli::{CaptureArgs, ConvertArgs};
use output::FileSinkFactory;
use source::SerialSource;

/// Initialise `env_logger`, honouring `RUST_LOG` and defaulting to `info`
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Capture from the serial port until Ctrl-C or a transport failure.
///
/// # Errors
///
/// Returns an error if the port cannot be opened, if reading from it fails,
/// or if an output file or the summary cannot be written.
pub fn run_capture(args: &CaptureArgs) -> anyhow::Result<()> {
    log::info!("slip-snoop {} starting", cli::LONG_VERSION);

    let stop_flag = Arc::new(AtomicBool::new(false));
    interrupt::install_interrupt_handler(Arc::clone(&stop_flag))
        .context("failed to install Ctrl-C handler")?;

    let mut source = SerialSource::open(&args.tty, args.baudrate, Arc::clone(&stop_flag))
        .context("failed to open serial port")?;

    let factory = FileSinkFactory::new(args.output.clone());
    let mut session = CaptureSession::new(factory, args.capture_config(), stop_flag);
    let result = session.run(&mut source);

    let created = session.factory().created();
    if let Some(last) = created.last() {
        log::info!("Wrote {} file(s), last: {}", created.len(), last.display());
    }

    if let Some(path) = &args.summary {
        capture::write_summary(path, session.summary())
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
    }

    result.context("capture failed")?;
    Ok(())
}

/// Convert one btsnoop file to pcap.
///
/// # Errors
///
/// Returns an error if the input cannot be read, is not a btsnoop file, or
/// the output cannot be written.
pub fn run_convert(args: &ConvertArgs) -> anyhow::Result<()> {
    let output = args.output_path();
    log::info!("Converting {} to {}", args.input.display(), output.display());

    let summary = convert::convert_file(&args.input, &output, &args.convert_options())
        .with_context(|| format!("failed to convert {}", args.input.display()))?;

    log::info!(
        "Converted {} records ({} skipped, {} trailing bytes dropped)",
        summary.records_converted,
        summary.records_skipped,
        summary.truncated_bytes
    );
    Ok(())
}
