//! Capture session: SLIP byte stream in, btsnoop out.
//!
//! A [`CaptureSession`] pulls bytes from a [`ByteSource`], de-frames them with
//! a [`SlipDecoder`] and routes every completed frame to an output sink
//! obtained from a [`SinkFactory`]. At most one sink is open at a time.
//!
//! # Modes
//!
//! - [`CaptureMode::Records`]: each frame is one H4 HCI packet. Frames are
//!   wrapped in btsnoop packet records and appended to a single file, opened
//!   when the first non-empty frame completes.
//! - [`CaptureMode::Raw`]: the device already produces a btsnoop stream and
//!   SLIP-escapes it, sending `END` when a new session starts. Each `END`
//!   closes the current sink; decoded bytes are streamed into a fresh one as
//!   they arrive, and the last session is kept when the capture stops.
//!
//! # Example
//!
//! ```ignore
//! let stop = Arc::new(AtomicBool::new(false));
//! let mut source = SerialSource::open(tty, 115_200, Arc::clone(&stop))?;
//! let mut session = CaptureSession::new(
//!     FileSinkFactory::new(None),
//!     CaptureConfig::default(),
//!     stop,
//! );
//! let summary = session.run(&mut source)?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::btsnoop::{
    BtsnoopError, BtsnoopWriter, TimestampEpoch, DATALINK_HCI_UART, IDENTIFICATION_PATTERN,
};
use crate::output::SinkFactory;
use crate::slip::{
    EscapePolicy, RawFrame, SlipByte, SlipDecoder, SlipEvent, DEFAULT_MAX_FRAME_LEN,
};
use crate::source::{ByteSource, TransportError};

/// Errors that end a capture session.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The byte source failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Creating, writing or closing an output sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing a btsnoop record failed.
    #[error("btsnoop error: {0}")]
    Btsnoop(#[from] BtsnoopError),

    /// Summary serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// How decoded frames are written out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Wrap each frame in a btsnoop record, all in one file
    #[default]
    Records,
    /// Stream each session between `END`s verbatim to its own file
    Raw,
}

/// Configuration for a capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Frame routing mode.
    pub mode: CaptureMode,
    /// Handling of invalid escape sequences.
    pub escape_policy: EscapePolicy,
    /// Largest frame accepted from the link.
    pub max_frame_len: usize,
    /// Datalink type written to the btsnoop header in records mode.
    pub datalink_type: u32,
    /// Epoch for record timestamps in records mode.
    pub epoch: TimestampEpoch,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Records,
            escape_policy: EscapePolicy::Permissive,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            datalink_type: DATALINK_HCI_UART,
            epoch: TimestampEpoch::Unix,
        }
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The byte source has no more data
    #[default]
    SourceExhausted,
    /// The stop flag was raised
    Interrupted,
    /// The byte source failed
    TransportFailed,
    /// Creating or writing an output sink failed
    OutputFailed,
}

/// Statistics for one capture session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureSummary {
    /// Frame routing mode used.
    pub mode: CaptureMode,
    /// Frames written to a sink (raw mode: sessions).
    pub frames_written: u64,
    /// Payload bytes written (record headers excluded).
    pub bytes_written: u64,
    /// Frames (raw mode: sessions) rejected by the decoder.
    pub frames_dropped: u64,
    /// Empty frames (back-to-back `END`s) ignored.
    #[serde(default)]
    pub empty_frames: u64,
    /// Sinks opened during the session.
    pub sinks_opened: u64,
    /// Bytes outside any frame or session: a records-mode partial frame at
    /// shutdown, or raw-mode bytes before the first `END`.
    #[serde(default)]
    pub discarded_bytes: u64,
    /// Session duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Why the session ended.
    #[serde(default)]
    pub end_reason: EndReason,
}

/// Raw-mode session being streamed to its own sink
struct RawSession<S: Write> {
    sink: S,
    bytes: u64,
    /// First bytes, checked against the btsnoop identification pattern
    head: Vec<u8>,
}

/// Drives one capture from byte source to output sinks.
pub struct CaptureSession<F: SinkFactory> {
    factory: F,
    config: CaptureConfig,
    decoder: SlipDecoder,
    /// Records-mode file
    writer: Option<BtsnoopWriter<F::Sink>>,
    /// Raw-mode file for the current session
    raw: Option<RawSession<F::Sink>>,
    /// Raw mode: an `END` has been seen and bytes belong to a session
    raw_armed: bool,
    summary: CaptureSummary,
    /// Raised externally (e.g. on Ctrl-C) to request an orderly stop
    stop_flag: Arc<AtomicBool>,
}

impl<F: SinkFactory> CaptureSession<F> {
    /// Create a session. Nothing is opened until a frame completes.
    pub fn new(factory: F, config: CaptureConfig, stop_flag: Arc<AtomicBool>) -> Self {
        let decoder =
            SlipDecoder::with_policy(config.escape_policy).with_max_frame_len(config.max_frame_len);
        Self {
            factory,
            decoder,
            writer: None,
            raw: None,
            raw_armed: false,
            summary: CaptureSummary {
                mode: config.mode,
                ..Default::default()
            },
            config,
            stop_flag,
        }
    }

    /// Statistics so far
    pub fn summary(&self) -> &CaptureSummary {
        &self.summary
    }

    /// Borrow the sink factory
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Whether a sink is currently open
    pub fn has_open_sink(&self) -> bool {
        self.writer.is_some() || self.raw.is_some()
    }

    /// Pull bytes from `source` until it is exhausted, the stop flag is
    /// raised, or it fails. The open sink is flushed and closed before
    /// returning. In records mode a partial frame is discarded; in raw mode
    /// the session written so far is kept.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Transport` if the source fails (after shutdown),
    /// and `CaptureError::Io`/`CaptureError::Btsnoop` if writing output fails.
    pub fn run<S: ByteSource + ?Sized>(&mut self, source: &mut S) -> Result<CaptureSummary> {
        let started = Instant::now();
        log::info!("Waiting for SLIP END");

        let outcome = loop {
            if self.stop_flag.load(Ordering::Acquire) {
                break Ok(EndReason::Interrupted);
            }
            match source.read_byte() {
                Ok(Some(byte)) => {
                    if let Err(e) = self.process_byte(byte) {
                        break Err((EndReason::OutputFailed, e));
                    }
                }
                Ok(None) if self.stop_flag.load(Ordering::Acquire) => {
                    break Ok(EndReason::Interrupted)
                }
                Ok(None) => break Ok(EndReason::SourceExhausted),
                Err(e) => break Err((EndReason::TransportFailed, e.into())),
            }
        };

        let shutdown = self.shutdown();
        self.summary.duration_ms = started.elapsed().as_millis() as u64;

        let reason = match outcome {
            Ok(reason) => reason,
            Err((reason, e)) => {
                self.summary.end_reason = reason;
                return Err(e);
            }
        };
        if let Err(e) = shutdown {
            self.summary.end_reason = EndReason::OutputFailed;
            return Err(e);
        }
        self.summary.end_reason = reason;

        log::info!(
            "Capture stopped ({:?}): {} frames, {} bytes, {} dropped",
            reason,
            self.summary.frames_written,
            self.summary.bytes_written,
            self.summary.frames_dropped
        );
        Ok(self.summary.clone())
    }

    /// Feed one byte through the decoder and act on any frame boundary.
    ///
    /// # Errors
    ///
    /// Returns an error only if writing output fails; decoder errors drop the
    /// affected frame and are counted.
    pub fn process_byte(&mut self, byte: u8) -> Result<()> {
        match self.config.mode {
            CaptureMode::Records => self.process_record_byte(byte),
            CaptureMode::Raw => self.process_raw_byte(byte),
        }
    }

    /// Flush and close the open sink. A partial records-mode frame is
    /// dropped; an open raw-mode session is kept as written.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing the sink fails.
    pub fn shutdown(&mut self) -> Result<()> {
        let discarded = self.decoder.finish();
        if discarded > 0 {
            log::info!("Discarding {} bytes of unfinished frame", discarded);
            self.summary.discarded_bytes += discarded as u64;
        }
        self.raw_armed = false;
        if let Some(bytes) = self.close_raw_session()? {
            log::info!("Closing file after {} bytes", bytes);
            self.summary.frames_written += 1;
        }
        self.close_sink()
    }

    fn process_record_byte(&mut self, byte: u8) -> Result<()> {
        match self.decoder.feed_byte(byte) {
            Ok(SlipEvent::Accumulating) => Ok(()),
            Ok(SlipEvent::Frame(frame)) => self.handle_frame(frame),
            Err(e) => {
                log::warn!("Dropping frame: {}", e);
                self.summary.frames_dropped += 1;
                if let Some(writer) = &mut self.writer {
                    writer.record_drops(1);
                }
                Ok(())
            }
        }
    }

    fn handle_frame(&mut self, frame: RawFrame) -> Result<()> {
        log::debug!("Encountered SLIP END ({} byte frame)", frame.len());

        if frame.is_empty() {
            self.summary.empty_frames += 1;
            return Ok(());
        }

        self.write_record_frame(&frame)?;
        self.summary.frames_written += 1;
        self.summary.bytes_written += frame.len() as u64;
        Ok(())
    }

    fn write_record_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.writer.is_none() {
            let sink = self.factory.open_sink()?;
            self.summary.sinks_opened += 1;
            let mut writer =
                BtsnoopWriter::new(sink, self.config.datalink_type).with_epoch(self.config.epoch);
            writer.write_header()?;
            // Frames rejected before the file existed still count as drops
            writer.record_drops(u32::try_from(self.summary.frames_dropped).unwrap_or(u32::MAX));
            self.writer = Some(writer);
        }

        if let Some(writer) = &mut self.writer {
            writer.write_frame(frame)?;
        }
        Ok(())
    }

    fn process_raw_byte(&mut self, byte: u8) -> Result<()> {
        match self.decoder.decode_byte(byte) {
            Ok(SlipByte::Pending) => Ok(()),
            Ok(SlipByte::Data(byte)) => self.write_raw_byte(byte),
            Ok(SlipByte::End) => {
                log::debug!("Encountered SLIP END");
                match self.close_raw_session()? {
                    Some(_) => self.summary.frames_written += 1,
                    None if self.raw_armed => self.summary.empty_frames += 1,
                    None => {}
                }
                self.raw_armed = true;
                Ok(())
            }
            Err(e) => {
                log::warn!("Abandoning session until next SLIP END: {}", e);
                self.summary.frames_dropped += 1;
                self.close_raw_session()?;
                self.raw_armed = false;
                Ok(())
            }
        }
    }

    fn write_raw_byte(&mut self, byte: u8) -> Result<()> {
        if !self.raw_armed {
            self.summary.discarded_bytes += 1;
            return Ok(());
        }

        if self.raw.is_none() {
            let sink = self.factory.open_sink()?;
            self.summary.sinks_opened += 1;
            self.raw = Some(RawSession {
                sink,
                bytes: 0,
                head: Vec::with_capacity(IDENTIFICATION_PATTERN.len()),
            });
        }
        let Some(session) = &mut self.raw else {
            return Ok(());
        };

        session.sink.write_all(&[byte])?;
        session.bytes += 1;
        if session.head.len() < IDENTIFICATION_PATTERN.len() {
            session.head.push(byte);
            if session.head.len() == IDENTIFICATION_PATTERN.len()
                && session.head != IDENTIFICATION_PATTERN
            {
                log::warn!("Raw session does not start with a btsnoop header");
            }
        }
        self.summary.bytes_written += 1;
        Ok(())
    }

    /// Flush and drop the raw-mode sink, returning its length if one was open
    fn close_raw_session(&mut self) -> Result<Option<u64>> {
        match self.raw.take() {
            Some(mut session) => {
                session.sink.flush()?;
                log::debug!("Closed raw session after {} bytes", session.bytes);
                Ok(Some(session.bytes))
            }
            None => Ok(None),
        }
    }

    fn close_sink(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            log::debug!("Closed sink after {} records", writer.records_written());
        }
        Ok(())
    }
}

/// Save a capture summary as pretty-printed JSON
///
/// # Errors
///
/// Returns `CaptureError::Json` if serialization fails and
/// `CaptureError::Io` if the file cannot be written.
pub fn write_summary(path: &Path, summary: &CaptureSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json)?;
    log::debug!("Saved capture summary to {}", path.display());
    Ok(())
}

/// Load a capture summary from JSON
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read and
/// `CaptureError::Json` if the JSON is invalid.
pub fn read_summary(path: &Path) -> Result<CaptureSummary> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}
