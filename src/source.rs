//! Byte sources feeding the capture session
//!
//! The session pulls exactly one byte at a time and blocks until it arrives.
//! [`SerialSource`] reads from a tty through the `serialport` crate;
//! [`ReaderSource`] adapts anything implementing [`Read`], which covers
//! recorded streams, pipes and tests.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a serial read waits before re-checking the stop flag
const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors raised by a byte source. Always fatal to the capture session.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The serial device could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Device path.
        path: PathBuf,
        /// Underlying serial port error.
        source: serialport::Error,
    },

    /// Reading from the transport failed.
    #[error("transport read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// A blocking, one-byte-at-a-time byte stream.
pub trait ByteSource {
    /// Block until one byte is available.
    ///
    /// Returns `Ok(None)` once the source is exhausted and will never yield
    /// another byte.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the underlying transport fails.
    fn read_byte(&mut self) -> Result<Option<u8>>;
}

/// Byte source over any [`Read`] implementation
pub struct ReaderSource<R: Read> {
    inner: R,
}

impl<R: Read> ReaderSource<R> {
    /// Wrap a reader. Wrap slow readers in a `BufReader` first.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> ByteSource for ReaderSource<R> {
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Byte source reading a serial tty.
///
/// Reads use a short timeout so the shared stop flag is noticed while the
/// link is idle; once it is set the source reports itself exhausted.
pub struct SerialSource {
    port: Box<dyn serialport::SerialPort>,
    stop_flag: Arc<AtomicBool>,
}

impl SerialSource {
    /// Open `path` at `baudrate` (8N1, no flow control)
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Open` if the device cannot be opened.
    pub fn open(path: &Path, baudrate: u32, stop_flag: Arc<AtomicBool>) -> Result<Self> {
        let port = serialport::new(path.to_string_lossy(), baudrate)
            .timeout(SERIAL_POLL_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        log::info!("Opened {} at {} baud", path.display(), baudrate);
        Ok(Self { port, stop_flag })
    }
}

impl ByteSource for SerialSource {
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            if self.stop_flag.load(Ordering::Acquire) {
                return Ok(None);
            }
            match self.port.read(&mut byte) {
                Ok(0) => {}
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
