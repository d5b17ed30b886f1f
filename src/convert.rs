//! btsnoop to pcap conversion
//!
//! Streams a btsnoop capture through [`BtsnoopRecordParser`] one byte at a
//! time and re-emits every record as a pcap record tagged with the Bluetooth
//! HCI H4 linktype.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use slip_snoop_lib::convert::{convert_file, ConvertOptions};
//!
//! let summary = convert_file(
//!     Path::new("20250101-120000.btsnoop"),
//!     Path::new("20250101-120000.pcap"),
//!     &ConvertOptions::default(),
//! )?;
//! println!("{} records converted", summary.records_converted);
//! ```

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::btsnoop::{
    BtsnoopError, BtsnoopFileHeader, BtsnoopRecordParser, TimestampEpoch, DATALINK_HCI_UART,
    DEFAULT_MAX_RECORD_LEN, FILE_HEADER_LEN,
};
use crate::pcap::{to_pcap_record_with, PcapError, PcapLinkType, PcapWriter};

/// Errors that can abort a conversion.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Reading the source or writing the target failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source ended before a complete btsnoop header.
    #[error("truncated btsnoop header: {0} of 16 bytes")]
    TruncatedHeader(usize),

    /// The source header or a record could not be decoded.
    #[error("btsnoop error: {0}")]
    Btsnoop(#[from] BtsnoopError),

    /// Writing pcap output failed.
    #[error("pcap error: {0}")]
    Pcap(#[from] PcapError),

    /// The output path names the input file.
    #[error("output {0} would overwrite the input")]
    SameFile(PathBuf),
}

/// Result type alias for conversion operations.
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Configuration for a conversion.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Epoch of the source timestamps.
    pub epoch: TimestampEpoch,
    /// Linktype declared in the pcap header.
    pub linktype: PcapLinkType,
    /// Largest record payload accepted from the source.
    pub max_record_len: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            epoch: TimestampEpoch::Unix,
            linktype: PcapLinkType::H4,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
        }
    }
}

/// Outcome of a conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSummary {
    /// Datalink type declared by the source.
    pub datalink_type: u32,
    /// Records written to the pcap output.
    pub records_converted: u64,
    /// Records rejected and left out.
    pub records_skipped: u64,
    /// Bytes of an incomplete final record that were dropped.
    pub truncated_bytes: u64,
}

/// Default target path: the input with a `.pcap` extension, or with `.pcap`
/// appended when the input already has one
pub fn default_output_path(input: &Path) -> PathBuf {
    let is_pcap = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pcap"));
    if is_pcap {
        let mut name = input.as_os_str().to_owned();
        name.push(".pcap");
        PathBuf::from(name)
    } else {
        input.with_extension("pcap")
    }
}

/// Convert a btsnoop stream into a pcap stream.
///
/// The 16-byte source header is validated and consumed first. Every
/// remaining byte goes through the record parser; each completed record is
/// appended after the pcap global header.
///
/// Malformed records and records whose timestamps pcap cannot express are
/// skipped. A truncated final record is dropped.
///
/// # Errors
///
/// Returns `ConvertError::TruncatedHeader` or `ConvertError::Btsnoop` for an
/// unusable source header, `ConvertError::Btsnoop` when a record exceeds the
/// size limit (the stream cannot be re-aligned after that), and
/// `ConvertError::Io`/`ConvertError::Pcap` for read or write failures.
pub fn convert<R: Read, W: Write>(
    input: R,
    output: W,
    options: &ConvertOptions,
) -> Result<ConversionSummary> {
    let mut input = BufReader::new(input);
    let header = read_file_header(&mut input)?;

    if header.datalink_type != DATALINK_HCI_UART {
        log::warn!(
            "Source datalink type {} is not HCI UART (1002); payloads are copied unchanged",
            header.datalink_type
        );
    }

    let mut summary = ConversionSummary {
        datalink_type: header.datalink_type,
        ..Default::default()
    };

    let snaplen = options.linktype.snaplen_for(options.max_record_len);
    let mut writer = PcapWriter::new(output, options.linktype).with_snaplen(snaplen);
    writer.emit_pcap_header()?;

    let mut parser = BtsnoopRecordParser::new(options.max_record_len);
    let mut offset = FILE_HEADER_LEN as u64;

    for byte in input.bytes() {
        let byte = byte?;
        offset += 1;

        let record = match parser.feed_byte(byte) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e @ BtsnoopError::MalformedRecord { .. }) => {
                log::warn!("Skipping record ending at offset {}: {}", offset, e);
                summary.records_skipped += 1;
                continue;
            }
            Err(e) => {
                log::error!("Unrecoverable record at offset {}: {}", offset, e);
                return Err(e.into());
            }
        };

        let written = to_pcap_record_with(&record, options.epoch, options.linktype)
            .and_then(|pcap_record| writer.write_record(&pcap_record));
        match written {
            Ok(()) => summary.records_converted += 1,
            Err(
                e @ (PcapError::TimestampOutOfRange(_)
                | PcapError::RecordTooLong(_)
                | PcapError::ExceedsSnaplen { .. }),
            ) => {
                log::warn!("Skipping record ending at offset {}: {}", offset, e);
                summary.records_skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let pending = parser.pending_len();
    if pending > 0 {
        log::warn!("Dropping truncated final record ({} bytes)", pending);
        summary.truncated_bytes = pending as u64;
    }

    writer.flush()?;

    log::info!(
        "Converted {} records ({} skipped)",
        summary.records_converted,
        summary.records_skipped
    );

    Ok(summary)
}

/// Convert the btsnoop file at `input` into a pcap file at `output`.
///
/// # Errors
///
/// Returns `ConvertError::SameFile` if `output` resolves to `input`,
/// `ConvertError::Io` if either file cannot be opened, plus any error from
/// [`convert`].
pub fn convert_file(
    input: &Path,
    output: &Path,
    options: &ConvertOptions,
) -> Result<ConversionSummary> {
    let source = File::open(input)?;
    if is_same_file(input, output) {
        return Err(ConvertError::SameFile(output.to_path_buf()));
    }
    let target = BufWriter::new(File::create(output)?);

    log::info!("Converting {} -> {}", input.display(), output.display());
    convert(source, target, options)
}

/// Both paths exist and resolve to the same file
fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn read_file_header<R: Read>(input: &mut R) -> Result<BtsnoopFileHeader> {
    let mut bytes = [0u8; FILE_HEADER_LEN];
    let mut filled = 0;
    while filled < FILE_HEADER_LEN {
        match input.read(&mut bytes[filled..]) {
            Ok(0) => return Err(ConvertError::TruncatedHeader(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(BtsnoopFileHeader::from_bytes(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btsnoop::{BtsnoopPacketRecord, BtsnoopWriter, DATALINK_HCI_UNENCAPSULATED};
    use crate::pcap::{FILE_HEADER_LEN as PCAP_HEADER_LEN, RECORD_HEADER_LEN};

    fn capture_with(records: &[BtsnoopPacketRecord]) -> Vec<u8> {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
        writer.write_header().unwrap();
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.into_inner()
    }

    fn record(payload: &[u8], timestamp_us: i64) -> BtsnoopPacketRecord {
        BtsnoopPacketRecord::new(payload.to_vec(), 0, timestamp_us).unwrap()
    }

    #[test]
    fn test_convert_empty_capture() {
        let mut out = Vec::new();
        let summary = convert(&capture_with(&[])[..], &mut out, &ConvertOptions::default()).unwrap();

        assert_eq!(summary.records_converted, 0);
        assert_eq!(summary.datalink_type, DATALINK_HCI_UART);
        assert_eq!(out.len(), PCAP_HEADER_LEN);
    }

    #[test]
    fn test_convert_records() {
        let source = capture_with(&[
            record(&[0x01, 0x03, 0x0C, 0x00], 1_500_000),
            record(&[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00], 2_000_001),
        ]);

        let mut out = Vec::new();
        let summary = convert(&source[..], &mut out, &ConvertOptions::default()).unwrap();
        assert_eq!(summary.records_converted, 2);
        assert_eq!(summary.records_skipped, 0);

        let first = &out[PCAP_HEADER_LEN..];
        assert_eq!(&first[0..4], &1u32.to_le_bytes());
        assert_eq!(&first[4..8], &500_000u32.to_le_bytes());
        assert_eq!(&first[8..12], &4u32.to_le_bytes());
        assert_eq!(&first[16..20], &[0x01, 0x03, 0x0C, 0x00]);

        let second = &first[RECORD_HEADER_LEN + 4..];
        assert_eq!(&second[0..4], &2u32.to_le_bytes());
        assert_eq!(&second[4..8], &1u32.to_le_bytes());
        assert_eq!(second.len(), RECORD_HEADER_LEN + 7);
    }

    #[test]
    fn test_truncated_header() {
        let result = convert(&b"btsnoop\0\0\0"[..], Vec::new(), &ConvertOptions::default());
        assert!(matches!(result, Err(ConvertError::TruncatedHeader(10))));
    }

    #[test]
    fn test_not_a_btsnoop_file() {
        let result = convert(&[0u8; 32][..], Vec::new(), &ConvertOptions::default());
        assert!(matches!(
            result,
            Err(ConvertError::Btsnoop(BtsnoopError::InvalidHeader))
        ));
    }

    #[test]
    fn test_truncated_final_record_dropped() {
        let mut source = capture_with(&[record(&[0x04, 0x01], 0), record(&[0x04, 0x02, 0x03], 0)]);
        source.truncate(source.len() - 2);

        let mut out = Vec::new();
        let summary = convert(&source[..], &mut out, &ConvertOptions::default()).unwrap();

        assert_eq!(summary.records_converted, 1);
        assert_eq!(summary.truncated_bytes, 24 + 1);
        assert_eq!(out.len(), PCAP_HEADER_LEN + RECORD_HEADER_LEN + 2);
    }

    #[test]
    fn test_malformed_record_skipped() {
        let mut bad = record(&[0xEE; 4], 0);
        bad.original_length = 2;

        let mut source = capture_with(&[record(&[0x01], 0)]);
        source.extend_from_slice(&bad.header_bytes());
        source.extend_from_slice(&bad.payload);
        source.extend_from_slice(&record(&[0x04], 0).header_bytes());
        source.push(0x04);

        let summary = convert(&source[..], Vec::new(), &ConvertOptions::default()).unwrap();
        assert_eq!(summary.records_converted, 2);
        assert_eq!(summary.records_skipped, 1);
    }

    #[test]
    fn test_oversized_record_aborts() {
        let source = capture_with(&[record(&[0u8; 64], 0)]);
        let options = ConvertOptions {
            max_record_len: 32,
            ..Default::default()
        };
        let result = convert(&source[..], Vec::new(), &options);
        assert!(matches!(
            result,
            Err(ConvertError::Btsnoop(BtsnoopError::RecordTooLong { .. }))
        ));
    }

    #[test]
    fn test_unrepresentable_timestamp_skipped() {
        let source = capture_with(&[record(&[0x01], -1), record(&[0x01], 0)]);
        let summary = convert(&source[..], Vec::new(), &ConvertOptions::default()).unwrap();
        assert_eq!(summary.records_converted, 1);
        assert_eq!(summary.records_skipped, 1);
    }

    #[test]
    fn test_other_datalink_still_converted() {
        let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UNENCAPSULATED);
        writer.write_header().unwrap();
        writer.write_record(&record(&[0x03, 0x0C, 0x00], 0)).unwrap();

        let summary =
            convert(&writer.into_inner()[..], Vec::new(), &ConvertOptions::default()).unwrap();
        assert_eq!(summary.datalink_type, DATALINK_HCI_UNENCAPSULATED);
        assert_eq!(summary.records_converted, 1);
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/tmp/20250101-120000.btsnoop")),
            PathBuf::from("/tmp/20250101-120000.pcap")
        );
        assert_eq!(
            default_output_path(Path::new("/tmp/hci.pcap")),
            PathBuf::from("/tmp/hci.pcap.pcap")
        );
        assert_eq!(
            default_output_path(Path::new("capture.PCAP")),
            PathBuf::from("capture.PCAP.pcap")
        );
    }

    #[test]
    fn test_snaplen_covers_largest_phdr_record() {
        let source = capture_with(&[record(&[0x04; 64], 0)]);
        let options = ConvertOptions {
            linktype: PcapLinkType::H4WithPhdr,
            max_record_len: 64,
            ..Default::default()
        };

        let mut out = Vec::new();
        let summary = convert(&source[..], &mut out, &options).unwrap();

        assert_eq!(summary.records_converted, 1);
        let snaplen = u32::from_le_bytes(out[16..20].try_into().unwrap());
        let record_header = &out[PCAP_HEADER_LEN..PCAP_HEADER_LEN + RECORD_HEADER_LEN];
        let captured = u32::from_le_bytes(record_header[8..12].try_into().unwrap());
        assert_eq!(snaplen, 68);
        assert_eq!(captured, 68);
    }

    #[test]
    fn test_snaplen_follows_max_record_len() {
        let options = ConvertOptions {
            max_record_len: 1 << 20,
            ..Default::default()
        };
        let mut out = Vec::new();
        convert(&capture_with(&[])[..], &mut out, &options).unwrap();
        assert_eq!(&out[16..20], &(1u32 << 20).to_le_bytes());
    }
}
