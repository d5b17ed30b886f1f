//! btsnoop capture format
//!
//! Encoding and decoding for the btsnoop file format used to store Bluetooth
//! HCI traffic.
//!
//! # File Format
//!
//! All header fields are big-endian:
//! ```text
//! file header:   [8s: "btsnoop\0"][u32: version = 1][u32: datalink type]
//! packet record: [u32: original length][u32: included length][u32: flags]
//!                [u32: cumulative drops][i64: timestamp us][included length bytes]
//! ```
//!
//! Records are self-describing: the included length must be read before the
//! end of the payload can be located, so parsing is strictly sequential.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identification pattern at the start of every btsnoop file
pub const IDENTIFICATION_PATTERN: [u8; 8] = *b"btsnoop\0";

/// The only btsnoop version in use
pub const VERSION: u32 = 1;

/// Size of the file header
pub const FILE_HEADER_LEN: usize = 16;

/// Size of a packet record header
pub const RECORD_HEADER_LEN: usize = 24;

/// Un-encapsulated HCI (no H4 packet type indicator)
pub const DATALINK_HCI_UNENCAPSULATED: u32 = 1001;
/// HCI UART (H4), the capture default
pub const DATALINK_HCI_UART: u32 = 1002;
/// HCI BCSP
pub const DATALINK_HCI_BSCP: u32 = 1003;
/// HCI serial (H5)
pub const DATALINK_HCI_SERIAL: u32 = 1004;

/// Microseconds between 0000-01-01 and 1970-01-01
pub const BTSNOOP_EPOCH_OFFSET_US: i64 = 0x00dc_ddb3_0f2f_8000;

/// Default upper bound on a record's included length
pub const DEFAULT_MAX_RECORD_LEN: usize = 256 * 1024;

/// Packet flag: bit 0 set means received (controller to host)
pub const FLAG_RECEIVED: u32 = 0x01;
/// Packet flag: bit 1 set means command or event rather than data
pub const FLAG_COMMAND_OR_EVENT: u32 = 0x02;

/// Errors that can occur reading or writing btsnoop data.
#[derive(Error, Debug)]
pub enum BtsnoopError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File does not start with the btsnoop identification pattern.
    #[error("not a btsnoop file: bad identification pattern")]
    InvalidHeader,

    /// Header carries a version other than 1.
    #[error("unsupported btsnoop version {0}")]
    UnsupportedVersion(u32),

    /// Record claims to include more than it originally had.
    #[error("malformed record: included length {included_length} exceeds original length {original_length}")]
    MalformedRecord {
        /// Declared included length.
        included_length: u32,
        /// Declared original length.
        original_length: u32,
    },

    /// Record payload is larger than the configured limit.
    #[error("record of {length} bytes exceeds {limit} byte limit")]
    RecordTooLong {
        /// Declared included length.
        length: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// `write_packet` payload does not fit the 16-bit length prefix.
    #[error("payload of {0} bytes does not fit a 16-bit length prefix")]
    PayloadTooLong(usize),

    /// Record's included length disagrees with its payload.
    #[error("included length {included_length} does not match payload of {payload_len} bytes")]
    LengthMismatch {
        /// Declared included length.
        included_length: u32,
        /// Actual payload length.
        payload_len: usize,
    },

    /// The file header was already written to this stream.
    #[error("file header already written")]
    HeaderAlreadyWritten,

    /// A record was written before the file header.
    #[error("file header not written yet")]
    HeaderNotWritten,
}

/// Result type alias for btsnoop operations.
pub type Result<T> = std::result::Result<T, BtsnoopError>;

/// Reference point for record timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TimestampEpoch {
    /// Microseconds since 1970-01-01 UTC
    #[default]
    Unix,
    /// Microseconds since 0000-01-01, the btsnoop convention
    Btsnoop,
}

impl TimestampEpoch {
    /// Offset of this epoch relative to the Unix epoch
    pub fn offset_us(self) -> i64 {
        match self {
            Self::Unix => 0,
            Self::Btsnoop => BTSNOOP_EPOCH_OFFSET_US,
        }
    }

    /// Convert a Unix timestamp into this epoch
    pub fn from_unix_us(self, unix_us: i64) -> i64 {
        unix_us.saturating_add(self.offset_us())
    }

    /// Convert a timestamp in this epoch back to Unix time
    pub fn to_unix_us(self, timestamp_us: i64) -> i64 {
        timestamp_us.saturating_sub(self.offset_us())
    }
}

/// Current wall-clock time in microseconds, expressed in `epoch`
pub fn current_time_us(epoch: TimestampEpoch) -> i64 {
    let unix_us = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_micros()).unwrap_or(i64::MAX),
        // Clock before 1970; report it as negative
        Err(e) => -i64::try_from(e.duration().as_micros()).unwrap_or(i64::MAX),
    };
    epoch.from_unix_us(unix_us)
}

/// H4 packet type indicator, the first byte of every UART HCI packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciPacketType {
    /// HCI command
    Command = 0x01,
    /// ACL data
    AclData = 0x02,
    /// Synchronous (SCO) data
    SyncData = 0x03,
    /// HCI event
    Event = 0x04,
    /// Isochronous data
    IsoData = 0x05,
}

impl HciPacketType {
    /// Parse the indicator byte
    pub fn from_indicator(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Command),
            0x02 => Some(Self::AclData),
            0x03 => Some(Self::SyncData),
            0x04 => Some(Self::Event),
            0x05 => Some(Self::IsoData),
            _ => None,
        }
    }

    /// btsnoop flags implied by the packet type.
    ///
    /// Commands are always sent and events always received. Data packets
    /// carry no direction in H4, so they are recorded as sent.
    pub fn packet_flags(self) -> u32 {
        match self {
            Self::Command => FLAG_COMMAND_OR_EVENT,
            Self::Event => FLAG_COMMAND_OR_EVENT | FLAG_RECEIVED,
            Self::AclData | Self::SyncData | Self::IsoData => 0,
        }
    }
}

/// btsnoop packet flags for an H4 frame, from its leading indicator byte
pub fn h4_packet_flags(frame: &[u8]) -> u32 {
    frame
        .first()
        .and_then(|&b| HciPacketType::from_indicator(b))
        .map_or(0, HciPacketType::packet_flags)
}

/// The 16-byte file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtsnoopFileHeader {
    /// How readers should interpret record payloads
    pub datalink_type: u32,
}

impl Default for BtsnoopFileHeader {
    fn default() -> Self {
        Self {
            datalink_type: DATALINK_HCI_UART,
        }
    }
}

impl BtsnoopFileHeader {
    /// Serialize to the on-disk layout
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_LEN] {
        let mut bytes = [0u8; FILE_HEADER_LEN];
        bytes[0..8].copy_from_slice(&IDENTIFICATION_PATTERN);
        bytes[8..12].copy_from_slice(&VERSION.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.datalink_type.to_be_bytes());
        bytes
    }

    /// Parse and validate a file header
    ///
    /// # Errors
    ///
    /// Returns `BtsnoopError::InvalidHeader` if the identification pattern is
    /// wrong and `BtsnoopError::UnsupportedVersion` for any version but 1.
    pub fn from_bytes(bytes: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if bytes[0..8] != IDENTIFICATION_PATTERN {
            return Err(BtsnoopError::InvalidHeader);
        }
        let version = be_u32(&bytes[8..12]);
        if version != VERSION {
            return Err(BtsnoopError::UnsupportedVersion(version));
        }
        Ok(Self {
            datalink_type: be_u32(&bytes[12..16]),
        })
    }
}

/// A single packet record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtsnoopPacketRecord {
    /// Payload length before truncation
    pub original_length: u32,
    /// Payload length actually stored
    pub included_length: u32,
    /// Direction and type bits
    pub packet_flags: u32,
    /// Packets dropped before this one
    pub cumulative_drops: u32,
    /// Capture time in microseconds
    pub timestamp_us: i64,
    /// `included_length` bytes of captured data
    pub payload: Vec<u8>,
}

impl BtsnoopPacketRecord {
    /// Build an untruncated record around `payload`
    ///
    /// # Errors
    ///
    /// Returns `BtsnoopError::RecordTooLong` if the payload length does not
    /// fit in 32 bits.
    pub fn new(payload: Vec<u8>, packet_flags: u32, timestamp_us: i64) -> Result<Self> {
        let length = u32::try_from(payload.len()).map_err(|_| BtsnoopError::RecordTooLong {
            length: payload.len(),
            limit: u32::MAX as usize,
        })?;
        Ok(Self {
            original_length: length,
            included_length: length,
            packet_flags,
            cumulative_drops: 0,
            timestamp_us,
            payload,
        })
    }

    /// Serialize the 24-byte record header
    pub fn header_bytes(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut bytes = [0u8; RECORD_HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.original_length.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.included_length.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.packet_flags.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.cumulative_drops.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.timestamp_us.to_be_bytes());
        bytes
    }

    /// Check the length invariants
    ///
    /// # Errors
    ///
    /// Returns `BtsnoopError::LengthMismatch` if the payload disagrees with the
    /// included length and `BtsnoopError::MalformedRecord` if more bytes are
    /// included than originally existed.
    pub fn validate(&self) -> Result<()> {
        if self.included_length as usize != self.payload.len() {
            return Err(BtsnoopError::LengthMismatch {
                included_length: self.included_length,
                payload_len: self.payload.len(),
            });
        }
        if self.included_length > self.original_length {
            return Err(BtsnoopError::MalformedRecord {
                included_length: self.included_length,
                original_length: self.original_length,
            });
        }
        Ok(())
    }

    /// Whether the record was captured in the received direction
    pub fn is_received(&self) -> bool {
        self.packet_flags & FLAG_RECEIVED != 0
    }
}

/// Writes a btsnoop stream: one header, then packet records.
pub struct BtsnoopWriter<W: Write> {
    inner: W,
    header: BtsnoopFileHeader,
    epoch: TimestampEpoch,
    header_written: bool,
    records_written: u64,
    cumulative_drops: u32,
}

impl<W: Write> BtsnoopWriter<W> {
    /// Create a writer for the given datalink type. Nothing is written yet.
    pub fn new(inner: W, datalink_type: u32) -> Self {
        Self {
            inner,
            header: BtsnoopFileHeader { datalink_type },
            epoch: TimestampEpoch::default(),
            header_written: false,
            records_written: 0,
            cumulative_drops: 0,
        }
    }

    /// Stamp records relative to `epoch` instead of the Unix epoch
    #[must_use]
    pub fn with_epoch(mut self, epoch: TimestampEpoch) -> Self {
        self.epoch = epoch;
        self
    }

    /// Number of packet records written so far
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Current cumulative drop count
    pub fn cumulative_drops(&self) -> u32 {
        self.cumulative_drops
    }

    /// Account for packets lost before the next record.
    ///
    /// The counter only ever grows.
    pub fn record_drops(&mut self, dropped: u32) {
        self.cumulative_drops = self.cumulative_drops.saturating_add(dropped);
    }

    /// Write the file header. Must be called once, before any record.
    ///
    /// # Errors
    ///
    /// Returns `BtsnoopError::HeaderAlreadyWritten` on a second call and
    /// `BtsnoopError::Io` if the write fails.
    pub fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Err(BtsnoopError::HeaderAlreadyWritten);
        }
        self.inner.write_all(&self.header.to_bytes())?;
        self.header_written = true;
        log::debug!(
            "Wrote btsnoop header, datalink type {}",
            self.header.datalink_type
        );
        Ok(())
    }

    /// Write a record carrying a little-endian `(opcode, length)` prefix
    /// followed by `payload`.
    ///
    /// The record's included and original lengths cover the prefix as well,
    /// so the record stays parseable by any btsnoop reader.
    ///
    /// # Errors
    ///
    /// Returns `BtsnoopError::PayloadTooLong` if `payload` exceeds 65535
    /// bytes, `BtsnoopError::HeaderNotWritten` before `write_header`, and
    /// `BtsnoopError::Io` if the write fails.
    pub fn write_packet(&mut self, opcode: u16, payload: &[u8]) -> Result<()> {
        let payload_len =
            u16::try_from(payload.len()).map_err(|_| BtsnoopError::PayloadTooLong(payload.len()))?;

        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&opcode.to_le_bytes());
        data.extend_from_slice(&payload_len.to_le_bytes());
        data.extend_from_slice(payload);

        let record = BtsnoopPacketRecord::new(data, 0, current_time_us(self.epoch))?;
        self.emit(record)
    }

    /// Write an H4 frame verbatim, deriving flags from its indicator byte
    ///
    /// # Errors
    ///
    /// Returns `BtsnoopError::HeaderNotWritten` before `write_header` and
    /// `BtsnoopError::Io` if the write fails.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let record = BtsnoopPacketRecord::new(
            frame.to_vec(),
            h4_packet_flags(frame),
            current_time_us(self.epoch),
        )?;
        self.emit(record)
    }

    /// Write a caller-built record as is, cumulative drops included
    ///
    /// # Errors
    ///
    /// Returns an error if the record violates its length invariants, if the
    /// header has not been written, or if the write fails.
    pub fn write_record(&mut self, record: &BtsnoopPacketRecord) -> Result<()> {
        record.validate()?;
        if !self.header_written {
            return Err(BtsnoopError::HeaderNotWritten);
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
    /// Returns `BtsnoopError::Io` if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Recover the underlying sink
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn emit(&mut self, mut record: BtsnoopPacketRecord) -> Result<()> {
        record.cumulative_drops = self.cumulative_drops;
        self.write_record(&record)
    }
}

/// Incremental record parser.
///
/// Bytes go in one at a time; a record comes out once its 24-byte header and
/// the payload it announces have arrived. The expected total length is known
/// as soon as the first 8 bytes are buffered.
#[derive(Debug)]
pub struct BtsnoopRecordParser {
    buffer: Vec<u8>,
    expected_total_len: Option<usize>,
    max_record_len: usize,
}

impl Default for BtsnoopRecordParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_LEN)
    }
}

impl BtsnoopRecordParser {
    /// Create a parser rejecting payloads above `max_record_len`
    pub fn new(max_record_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(RECORD_HEADER_LEN + 1024),
            expected_total_len: None,
            max_record_len,
        }
    }

    /// Bytes of the in-progress record
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Total size of the in-progress record, once known
    pub fn expected_total_len(&self) -> Option<usize> {
        self.expected_total_len
    }

    /// Drop any partial record
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_total_len = None;
    }

    /// Process one byte of record data
    ///
    /// # Errors
    ///
    /// Returns `BtsnoopError::RecordTooLong` as soon as an oversized included
    /// length is seen; the partial record is dropped and alignment with the
    /// stream is lost. Returns `BtsnoopError::MalformedRecord` once a record
    /// whose included length exceeds its original length has been fully
    /// consumed, so the next byte starts the next record.
    pub fn feed_byte(&mut self, byte: u8) -> Result<Option<BtsnoopPacketRecord>> {
        self.buffer.push(byte);

        if self.expected_total_len.is_none() && self.buffer.len() == 8 {
            let included = be_u32(&self.buffer[4..8]) as usize;
            if included > self.max_record_len {
                self.reset();
                return Err(BtsnoopError::RecordTooLong {
                    length: included,
                    limit: self.max_record_len,
                });
            }
            self.expected_total_len = Some(RECORD_HEADER_LEN + included);
        }

        match self.expected_total_len {
            Some(total) if self.buffer.len() == total => {
                let record = self.decode_buffer();
                self.reset();
                record.validate()?;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    fn decode_buffer(&self) -> BtsnoopPacketRecord {
        let b = &self.buffer;
        BtsnoopPacketRecord {
            original_length: be_u32(&b[0..4]),
            included_length: be_u32(&b[4..8]),
            packet_flags: be_u32(&b[8..12]),
            cumulative_drops: be_u32(&b[12..16]),
            timestamp_us: i64::from_be_bytes([
                b[16], b[17], b[18], b[19], b[20], b[21], b[22], b[23],
            ]),
            payload: b[RECORD_HEADER_LEN..].to_vec(),
        }
    }
}

#[inline]
fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(data: &[u8]) -> Vec<Result<BtsnoopPacketRecord>> {
        let mut parser = BtsnoopRecordParser::default();
        data.iter()
            .filter_map(|&b| parser.feed_byte(b).transpose())
            .collect()
    }

    // =========================================================================
    // Header Tests
    // =========================================================================

    #[test]
    fn test_fresh_header_bytes() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();

        assert_eq!(
            writer.into_inner(),
            vec![
                0x62, 0x74, 0x73, 0x6E, 0x6F, 0x6F, 0x70, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
                0x00, 0x03, 0xEA
            ]
        );
    }

    #[test]
    fn test_header_written_once() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();
        assert!(matches!(
            writer.write_header(),
            Err(BtsnoopError::HeaderAlreadyWritten)
        ));
        assert_eq!(writer.into_inner().len(), FILE_HEADER_LEN);
    }

    #[test]
    fn test_record_before_header_rejected() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        assert!(matches!(
            writer.write_frame(&[0x01, 0x03, 0x0C, 0x00]),
            Err(BtsnoopError::HeaderNotWritten)
        ));
        assert!(writer.into_inner().is_empty());
    }

    #[test]
    fn test_header_parse() {
        let bytes = BtsnoopFileHeader {
            datalink_type: DATALINK_HCI_UNENCAPSULATED,
        }
        .to_bytes();
        let header = BtsnoopFileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.datalink_type, 1001);
    }

    #[test]
    fn test_header_bad_pattern() {
        let mut bytes = BtsnoopFileHeader::default().to_bytes();
        bytes[0] = b'B';
        assert!(matches!(
            BtsnoopFileHeader::from_bytes(&bytes),
            Err(BtsnoopError::InvalidHeader)
        ));
    }

    #[test]
    fn test_header_bad_version() {
        let mut bytes = BtsnoopFileHeader::default().to_bytes();
        bytes[11] = 2;
        assert!(matches!(
            BtsnoopFileHeader::from_bytes(&bytes),
            Err(BtsnoopError::UnsupportedVersion(2))
        ));
    }

    // =========================================================================
    // Writer Tests
    // =========================================================================

    #[test]
    fn test_write_packet_layout() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();
        writer.write_packet(0x0C03, &[0xAA, 0xBB, 0xCC]).unwrap();

        let bytes = writer.into_inner();
        let record = &bytes[FILE_HEADER_LEN..];

        // Big-endian record header
        assert_eq!(&record[0..4], &[0, 0, 0, 7]); // original length
        assert_eq!(&record[4..8], &[0, 0, 0, 7]); // included length
        assert_eq!(&record[8..12], &[0, 0, 0, 0]); // flags
        assert_eq!(&record[12..16], &[0, 0, 0, 0]); // drops
        // Little-endian opcode and length prefix
        assert_eq!(&record[24..28], &[0x03, 0x0C, 0x03, 0x00]);
        assert_eq!(&record[28..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_write_packet_payload_too_long() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();
        let payload = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            writer.write_packet(0x0001, &payload),
            Err(BtsnoopError::PayloadTooLong(65536))
        ));
        assert_eq!(writer.records_written(), 0);
    }

    #[test]
    fn test_written_records_reparse_with_consistent_lengths() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();
        writer.write_packet(0x0C03, &[]).unwrap();
        writer.write_packet(0x2005, &[1, 2, 3, 4, 5, 6]).unwrap();
        writer.write_frame(&[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]).unwrap();
        assert_eq!(writer.records_written(), 3);

        let bytes = writer.into_inner();
        let records: Vec<_> = parse_all(&bytes[FILE_HEADER_LEN..])
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.included_length as usize, record.payload.len());
            assert_eq!(record.original_length, record.included_length);
        }
        assert_eq!(records[1].payload[0..4], [0x05, 0x20, 0x06, 0x00]);
    }

    #[test]
    fn test_write_frame_flags_from_indicator() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();
        writer.write_frame(&[0x01, 0x03, 0x0C, 0x00]).unwrap();
        writer.write_frame(&[0x04, 0x0E, 0x01, 0x01]).unwrap();
        writer.write_frame(&[0x02, 0x00, 0x20, 0x00, 0x00]).unwrap();

        let records: Vec<_> = parse_all(&writer.into_inner()[FILE_HEADER_LEN..])
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(records[0].packet_flags, 0x02);
        assert_eq!(records[1].packet_flags, 0x03);
        assert!(records[1].is_received());
        assert_eq!(records[2].packet_flags, 0x00);
    }

    #[test]
    fn test_cumulative_drops_monotonic() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();
        writer.write_frame(&[0x01]).unwrap();
        writer.record_drops(2);
        writer.write_frame(&[0x01]).unwrap();
        writer.record_drops(1);
        writer.write_packet(0x0001, &[]).unwrap();

        let drops: Vec<u32> = parse_all(&writer.into_inner()[FILE_HEADER_LEN..])
            .into_iter()
            .map(|r| r.unwrap().cumulative_drops)
            .collect();
        assert_eq!(drops, vec![0, 2, 3]);
    }

    #[test]
    fn test_write_record_rejects_inconsistent_lengths() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();
        let mut record = BtsnoopPacketRecord::new(vec![1, 2, 3], 0, 0).unwrap();
        record.original_length = 2;
        assert!(matches!(
            writer.write_record(&record),
            Err(BtsnoopError::MalformedRecord { .. })
        ));
        record.original_length = 3;
        record.included_length = 4;
        assert!(matches!(
            writer.write_record(&record),
            Err(BtsnoopError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_epoch_offset_applied_to_timestamps() {
        let before = current_time_us(TimestampEpoch::Unix);
        let mut writer =
            BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART).with_epoch(TimestampEpoch::Btsnoop);
        writer.write_header().unwrap();
        writer.write_frame(&[0x04]).unwrap();
        let after = current_time_us(TimestampEpoch::Unix);

        let record = parse_all(&writer.into_inner()[FILE_HEADER_LEN..])
            .remove(0)
            .unwrap();
        let unix = TimestampEpoch::Btsnoop.to_unix_us(record.timestamp_us);
        assert!(record.timestamp_us > BTSNOOP_EPOCH_OFFSET_US);
        assert!(before <= unix && unix <= after);
    }

    // =========================================================================
    // Parser Tests
    // =========================================================================

    #[test]
    fn test_parser_knows_length_after_eight_bytes() {
        let record = BtsnoopPacketRecord::new(vec![9; 10], 0, 42).unwrap();
        let mut parser = BtsnoopRecordParser::default();

        for &b in &record.header_bytes()[..7] {
            assert!(parser.feed_byte(b).unwrap().is_none());
        }
        assert_eq!(parser.expected_total_len(), None);
        parser.feed_byte(record.header_bytes()[7]).unwrap();
        assert_eq!(parser.expected_total_len(), Some(RECORD_HEADER_LEN + 10));
    }

    #[test]
    fn test_parser_emits_record_and_resets() {
        let record = BtsnoopPacketRecord::new(vec![0x04, 0x0E, 0x00], 0x03, -5).unwrap();
        let mut bytes = record.header_bytes().to_vec();
        bytes.extend_from_slice(&record.payload);

        let mut parser = BtsnoopRecordParser::default();
        let mut out = None;
        for &b in &bytes {
            if let Some(r) = parser.feed_byte(b).unwrap() {
                out = Some(r);
            }
        }

        assert_eq!(out, Some(record));
        assert_eq!(parser.pending_len(), 0);
        assert_eq!(parser.expected_total_len(), None);
    }

    #[test]
    fn test_parser_empty_payload() {
        let record = BtsnoopPacketRecord::new(Vec::new(), 0, 1).unwrap();
        let parsed = parse_all(&record.header_bytes());
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].as_ref().unwrap().payload, Vec::<u8>::new());
    }

    #[test]
    fn test_parser_rejects_malformed_and_stays_aligned() {
        let mut bad = BtsnoopPacketRecord::new(vec![1, 2, 3, 4], 0, 0).unwrap();
        bad.original_length = 1;
        let good = BtsnoopPacketRecord::new(vec![5, 6], 0, 0).unwrap();

        let mut bytes = bad.header_bytes().to_vec();
        bytes.extend_from_slice(&bad.payload);
        bytes.extend_from_slice(&good.header_bytes());
        bytes.extend_from_slice(&good.payload);

        let results = parse_all(&bytes);
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(BtsnoopError::MalformedRecord {
                included_length: 4,
                original_length: 1
            })
        ));
        assert_eq!(results[1].as_ref().unwrap(), &good);
    }

    #[test]
    fn test_parser_rejects_oversized_record() {
        let mut parser = BtsnoopRecordParser::new(16);
        let record = BtsnoopPacketRecord::new(vec![0; 17], 0, 0).unwrap();
        let header = record.header_bytes();

        for &b in &header[..7] {
            parser.feed_byte(b).unwrap();
        }
        assert!(matches!(
            parser.feed_byte(header[7]),
            Err(BtsnoopError::RecordTooLong {
                length: 17,
                limit: 16
            })
        ));
        assert_eq!(parser.pending_len(), 0);
    }

    #[test]
    fn test_h4_packet_flags() {
        assert_eq!(h4_packet_flags(&[0x01, 0x00]), FLAG_COMMAND_OR_EVENT);
        assert_eq!(
            h4_packet_flags(&[0x04]),
            FLAG_COMMAND_OR_EVENT | FLAG_RECEIVED
        );
        assert_eq!(h4_packet_flags(&[0x05]), 0);
        assert_eq!(h4_packet_flags(&[0x42]), 0);
        assert_eq!(h4_packet_flags(&[]), 0);
    }
}
