//! Synthetic HCI traffic generation
//!
//! Builds H4 packets with known contents and wraps them the way a device
//! logger would put them on the wire.
//!
//! # Example
//!
//! ```rust,ignore
//! use slip_snoop_lib::test_utils::{hci_command, hci_event, slip_stream};
//!
//! let reset = hci_command(0x0C03, &[]);
//! let complete = hci_event(0x0E, &[0x01, 0x03, 0x0C, 0x00]);
//! let wire = slip_stream(&[reset, complete]);
//! ```

use crate::btsnoop::{self, h4_packet_flags, BtsnoopPacketRecord, BtsnoopWriter, DATALINK_HCI_UART};
use crate::slip::{encode_frame, END};

/// H4 indicator for HCI commands
pub const H4_COMMAND: u8 = 0x01;
/// H4 indicator for ACL data
pub const H4_ACL: u8 = 0x02;
/// H4 indicator for HCI events
pub const H4_EVENT: u8 = 0x04;

/// H4 command packet: indicator, little-endian opcode, length, parameters
pub fn hci_command(opcode: u16, params: &[u8]) -> Vec<u8> {
    let mut packet = vec![H4_COMMAND];
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// H4 event packet: indicator, event code, length, parameters
pub fn hci_event(code: u8, params: &[u8]) -> Vec<u8> {
    let mut packet = vec![H4_EVENT, code, params.len() as u8];
    packet.extend_from_slice(params);
    packet
}

/// H4 ACL packet with a 12-bit connection handle
pub fn hci_acl(handle: u16, data: &[u8]) -> Vec<u8> {
    let mut packet = vec![H4_ACL];
    packet.extend_from_slice(&(handle & 0x0FFF).to_le_bytes());
    packet.extend_from_slice(&(data.len() as u16).to_le_bytes());
    packet.extend_from_slice(data);
    packet
}

/// Command Complete event for `opcode` with the given status
pub fn command_complete(opcode: u16, status: u8) -> Vec<u8> {
    let [lo, hi] = opcode.to_le_bytes();
    hci_event(0x0E, &[0x01, lo, hi, status])
}

/// Wire bytes for `frames`: a leading `END`, then each frame SLIP-encoded
pub fn slip_stream(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut wire = vec![END];
    for frame in frames {
        wire.extend(encode_frame(frame));
    }
    wire
}

/// A complete btsnoop file holding `payloads`, with timestamps one second
/// apart starting at `first_timestamp_us`
///
/// # Errors
///
/// Returns an error if a payload is too long for a btsnoop record.
pub fn btsnoop_file(payloads: &[Vec<u8>], first_timestamp_us: i64) -> btsnoop::Result<Vec<u8>> {
    let mut writer = BtsnoopWriter::new(Vec::new(), DATALINK_HCI_UART);
    writer.write_header()?;
    for (i, payload) in payloads.iter().enumerate() {
        let record = BtsnoopPacketRecord::new(
            payload.clone(),
            h4_packet_flags(payload),
            first_timestamp_us + i as i64 * 1_000_000,
        )?;
        writer.write_record(&record)?;
    }
    Ok(writer.into_inner())
}

/// A typical controller bring-up exchange
pub fn reset_sequence() -> Vec<Vec<u8>> {
    vec![
        hci_command(0x0C03, &[]),
        command_complete(0x0C03, 0x00),
        hci_command(0x1001, &[]),
        hci_event(
            0x0E,
            &[0x01, 0x01, 0x10, 0x00, 0x0B, 0x00, 0x00, 0x0B, 0x5F, 0x00, 0x00, 0x00],
        ),
        hci_acl(0x0040, &[0x05, 0x00, 0x04, 0x00, 0x0A, 0xC0, 0xDB, 0x00, 0x01]),
    ]
}
