//! pcap output
//!
//! The classic libpcap container is simple enough to write by hand. Files are
//! written little-endian on every platform.
//!
//! # File Format
//!
//! ```text
//! global header: [u32: magic 0xA1B2C3D4][u16: major 2][u16: minor 4]
//!                [i32: thiszone][u32: sigfigs][u32: snaplen][u32: linktype]
//! packet record: [u32: ts seconds][u32: ts microseconds]
//!                [u32: captured length][u32: original length][captured bytes]
//! ```
//!
//! Useful resources:
//! * <https://www.ietf.org/archive/id/draft-gharris-opsawg-pcap-01.html>
//! * <https://www.tcpdump.org/linktypes.html>

use std::io::Write;
use thiserror::Error;

use crate::btsnoop::{BtsnoopPacketRecord, TimestampEpoch};

/// Microsecond-resolution magic number
pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
/// Format major version
pub const VERSION_MAJOR: u16 = 2;
/// Format minor version
pub const VERSION_MINOR: u16 = 4;
/// Size of the global header
pub const FILE_HEADER_LEN: usize = 24;
/// Size of a packet record header
pub const RECORD_HEADER_LEN: usize = 16;
/// Default snapshot length, the largest libpcap accepts
pub const DEFAULT_SNAPLEN: u32 = 262_144;

/// Bluetooth HCI UART transport framing
pub const LINKTYPE_BLUETOOTH_HCI_H4: u32 = 187;
/// H4 framing preceded by a 4-byte direction pseudo-header
pub const LINKTYPE_BLUETOOTH_HCI_H4_WITH_PHDR: u32 = 201;
/// Size of the H4 direction pseudo-header
pub const PHDR_LEN: usize = 4;

const USEC_PER_SEC: i64 = 1_000_000;

/// Errors that can occur producing pcap output.
#[derive(Error, Debug)]
pub enum PcapError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timestamp falls outside the 32-bit seconds range pcap can express.
    #[error("timestamp {0} us is outside the pcap range")]
    TimestampOutOfRange(i64),

    /// Payload length does not fit in 32 bits.
    #[error("record of {0} bytes is too long for pcap")]
    RecordTooLong(usize),

    /// The global header was already written to this stream.
    #[error("global header already written")]
    HeaderAlreadyWritten,

    /// A record was written before the global header.
    #[error("global header not written yet")]
    HeaderNotWritten,

    /// A record is larger than the snapshot length declared in the header.
    #[error("record of {captured} bytes exceeds snaplen {snaplen}")]
    ExceedsSnaplen {
        /// Captured length of the record.
        captured: u32,
        /// Snapshot length of the file.
        snaplen: u32,
    },
}

/// Result type alias for pcap operations.
pub type Result<T> = std::result::Result<T, PcapError>;

/// Link-layer type declared in the global header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum PcapLinkType {
    /// `LINKTYPE_BLUETOOTH_HCI_H4` (187)
    #[default]
    H4,
    /// `LINKTYPE_BLUETOOTH_HCI_H4_WITH_PHDR` (201)
    H4WithPhdr,
}

impl PcapLinkType {
    /// Numeric linktype value
    pub fn value(self) -> u32 {
        match self {
            Self::H4 => LINKTYPE_BLUETOOTH_HCI_H4,
            Self::H4WithPhdr => LINKTYPE_BLUETOOTH_HCI_H4_WITH_PHDR,
        }
    }

    /// Bytes this linktype adds in front of every payload
    pub fn header_overhead(self) -> usize {
        match self {
            Self::H4 => 0,
            Self::H4WithPhdr => PHDR_LEN,
        }
    }

    /// Snapshot length that fits payloads of up to `max_payload_len` bytes
    pub fn snaplen_for(self, max_payload_len: usize) -> u32 {
        max_payload_len
            .checked_add(self.header_overhead())
            .and_then(|len| u32::try_from(len).ok())
            .unwrap_or(u32::MAX)
    }
}

/// The 24-byte global header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapFileHeader {
    /// Maximum captured length of any record
    pub snaplen: u32,
    /// Payload encoding for every record
    pub linktype: u32,
}

impl Default for PcapFileHeader {
    fn default() -> Self {
        Self {
            snaplen: DEFAULT_SNAPLEN,
            linktype: LINKTYPE_BLUETOOTH_HCI_H4,
        }
    }
}

impl PcapFileHeader {
    /// Serialize to the on-disk layout
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_LEN] {
        let mut bytes = [0u8; FILE_HEADER_LEN];
        bytes[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
        bytes[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        bytes[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        // thiszone (8..12) and sigfigs (12..16) stay zero: timestamps are UTC
        bytes[16..20].copy_from_slice(&self.snaplen.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.linktype.to_le_bytes());
        bytes
    }
}

/// A single pcap packet record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapPacketRecord {
    /// Seconds since the Unix epoch
    pub ts_seconds: u32,
    /// Sub-second part in microseconds
    pub ts_microseconds: u32,
    /// Bytes stored in this record
    pub captured_length: u32,
    /// Bytes on the wire
    pub original_length: u32,
    /// `captured_length` bytes of data
    pub payload: Vec<u8>,
}

impl PcapPacketRecord {
    /// Serialize the 16-byte record header
    pub fn header_bytes(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut bytes = [0u8; RECORD_HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.ts_seconds.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.ts_microseconds.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.captured_length.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.original_length.to_le_bytes());
        bytes
    }
}

/// Project a btsnoop record whose timestamp is Unix-relative into pcap.
///
/// The timestamp is split into whole seconds and the microsecond remainder;
/// lengths and payload are copied unchanged.
///
/// # Errors
///
/// Returns `PcapError::TimestampOutOfRange` if the seconds do not fit pcap's
/// unsigned 32-bit field.
pub fn to_pcap_record(record: &BtsnoopPacketRecord) -> Result<PcapPacketRecord> {
    to_pcap_record_with(record, TimestampEpoch::Unix, PcapLinkType::H4)
}

/// Project a btsnoop record into pcap, re-basing from `epoch` and shaping the
/// payload for `linktype`.
///
/// For [`PcapLinkType::H4WithPhdr`] the payload gains a 4-byte big-endian
/// direction word (0 sent, 1 received) taken from the btsnoop flags, and both
/// lengths grow by 4.
///
/// # Errors
///
/// Returns `PcapError::TimestampOutOfRange` if the re-based seconds do not
/// fit pcap's unsigned 32-bit field and `PcapError::RecordTooLong` if the
/// grown length overflows.
pub fn to_pcap_record_with(
    record: &BtsnoopPacketRecord,
    epoch: TimestampEpoch,
    linktype: PcapLinkType,
) -> Result<PcapPacketRecord> {
    let unix_us = epoch.to_unix_us(record.timestamp_us);
    let ts_seconds = u32::try_from(unix_us.div_euclid(USEC_PER_SEC))
        .map_err(|_| PcapError::TimestampOutOfRange(record.timestamp_us))?;
    // rem_euclid keeps this in 0..1_000_000
    let ts_microseconds = unix_us.rem_euclid(USEC_PER_SEC) as u32;

    let (payload, captured_length, original_length) = match linktype {
        PcapLinkType::H4 => (
            record.payload.clone(),
            record.included_length,
            record.original_length,
        ),
        PcapLinkType::H4WithPhdr => {
            let direction: u32 = u32::from(record.is_received());
            let mut payload = Vec::with_capacity(PHDR_LEN + record.payload.len());
            payload.extend_from_slice(&direction.to_be_bytes());
            payload.extend_from_slice(&record.payload);
            let grow = |len: u32| {
                len.checked_add(PHDR_LEN as u32)
                    .ok_or(PcapError::RecordTooLong(record.payload.len()))
            };
            (
                payload,
                grow(record.included_length)?,
                grow(record.original_length)?,
            )
        }
    };

    Ok(PcapPacketRecord {
        ts_seconds,
        ts_microseconds,
        captured_length,
        original_length,
        payload,
    })
}

/// Writes a pcap stream: one global header, then packet records.
pub struct PcapWriter<W: Write> {
    inner: W,
    header: PcapFileHeader,
    header_written: bool,
    records_written: u64,
}

impl<W: Write> PcapWriter<W> {
    /// Create a writer for `linktype`. Nothing is written yet.
    pub fn new(inner: W, linktype: PcapLinkType) -> Self {
        Self {
            inner,
            header: PcapFileHeader {
                linktype: linktype.value(),
                ..Default::default()
            },
            header_written: false,
            records_written: 0,
        }
    }

    /// Override the advertised snapshot length
    #[must_use]
    pub fn with_snaplen(mut self, snaplen: u32) -> Self {
        self.header.snaplen = snaplen;
        self
    }

    /// Number of packet records written so far
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Write the global header. Must be called once, before any record.
    ///
    /// # Errors
    ///
    /// Returns `PcapError::HeaderAlreadyWritten` on a second call and
    /// `PcapError::Io` if the write fails.
    pub fn emit_pcap_header(&mut self) -> Result<()> {
        if self.header_written {
            return Err(PcapError::HeaderAlreadyWritten);
        }
        self.inner.write_all(&self.header.to_bytes())?;
        self.header_written = true;
        Ok(())
    }

    /// Append one packet record
    ///
    /// # Errors
    ///
    /// Returns `PcapError::HeaderNotWritten` before `emit_pcap_header`,
    /// `PcapError::ExceedsSnaplen` for a record larger than the declared
    /// snapshot length, and `PcapError::Io` if the write fails.
    pub fn write_record(&mut self, record: &PcapPacketRecord) -> Result<()> {
        if !self.header_written {
            return Err(PcapError::HeaderNotWritten);
        }
        if record.captured_length > self.header.snaplen {
            return Err(PcapError::ExceedsSnaplen {
                captured: record.captured_length,
                snaplen: self.header.snaplen,
            });
        }
        self.inner.write_all(&record.header_bytes())?;
        self.inner.write_all(&record.payload)?;
        self.records_written += 1;
        Ok(())
    }

    /// Flush the underlying sink
    ///
    /// # Errors
    ///
    /// Returns `PcapError::Io` if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Recover the underlying sink
    pub fn into_inner(self) -> W {
        self.inner
    }
}
