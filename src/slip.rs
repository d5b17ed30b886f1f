//! SLIP de-framing for the snoop serial link
//!
//! The device side byte-stuffs its output so that `END` only ever appears as a
//! frame delimiter. This module removes that stuffing one byte at a time and
//! reports a frame boundary whenever an unescaped `END` arrives.
//!
//! # Usage
//!
//! ```rust,ignore
//! use slip_snoop_lib::slip::{SlipDecoder, SlipEvent};
//!
//! let mut decoder = SlipDecoder::new();
//!
//! for byte in serial_bytes {
//!     if let SlipEvent::Frame(frame) = decoder.feed_byte(byte)? {
//!         // Unescaped frame content, delimiter stripped
//!         handle_frame(frame);
//!     }
//! }
//! ```

use std::ops::Deref;
use thiserror::Error;

/// Frame delimiter
pub const END: u8 = 0xC0;
/// Escape introducer
pub const ESC: u8 = 0xDB;
/// Escaped form of [`END`]
pub const ESC_END: u8 = 0xDC;
/// Escaped form of [`ESC`]
pub const ESC_ESC: u8 = 0xDD;

/// Default upper bound on a single decoded frame.
///
/// Raw-mode frames carry a whole btsnoop session, so this is generous.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors raised while de-framing. Neither is fatal to the stream: the
/// affected frame is dropped and decoding resumes at the next `END`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlipError {
    /// `ESC` was followed by something other than `ESC_END` or `ESC_ESC`
    /// while running with [`EscapePolicy::Strict`].
    #[error("invalid escape sequence: ESC followed by {byte:#04x}")]
    InvalidEscape {
        /// The byte that followed `ESC`.
        byte: u8,
    },

    /// The frame grew past the configured limit.
    #[error("frame exceeds {limit} byte limit")]
    FrameTooLong {
        /// Configured maximum frame length.
        limit: usize,
    },
}

/// What to do with a byte after `ESC` that is not a valid continuation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum EscapePolicy {
    /// Keep the byte verbatim and carry on
    #[default]
    Permissive,
    /// Reject the frame with [`SlipError::InvalidEscape`]
    Strict,
}

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlipState {
    /// Plain bytes are copied into the current frame
    Normal,
    /// Previous byte was `ESC`
    EscapePending,
    /// Current frame was rejected; bytes are dropped until the next `END`
    Discarding,
}

/// A de-escaped frame, delimiter removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame(Vec<u8>);

impl RawFrame {
    /// Take ownership of the frame bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    /// Borrow the frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for RawFrame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Result of feeding a single byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlipEvent {
    /// No boundary yet, continue feeding
    Accumulating,
    /// An unescaped `END` closed this frame (possibly empty)
    Frame(RawFrame),
}

/// Result of unescaping a single byte without buffering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlipByte {
    /// `ESC` seen, the next byte decides
    Pending,
    /// One decoded payload byte
    Data(u8),
    /// Unescaped `END`
    End,
}

/// Byte-at-a-time SLIP decoder
#[derive(Debug)]
pub struct SlipDecoder {
    /// Frame being assembled
    frame_buffer: Vec<u8>,
    state: SlipState,
    policy: EscapePolicy,
    max_frame_len: usize,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    /// Create a permissive decoder with the default frame limit
    pub fn new() -> Self {
        Self::with_policy(EscapePolicy::default())
    }

    /// Create a decoder with an explicit escape policy
    pub fn with_policy(policy: EscapePolicy) -> Self {
        Self {
            frame_buffer: Vec::with_capacity(1024),
            state: SlipState::Normal,
            policy,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Override the maximum frame length
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Current state
    pub fn state(&self) -> SlipState {
        self.state
    }

    /// Escape policy in effect
    pub fn policy(&self) -> EscapePolicy {
        self.policy
    }

    /// Bytes accumulated for the in-progress frame
    pub fn buffer_len(&self) -> usize {
        self.frame_buffer.len()
    }

    /// Return to the initial state, dropping any partial frame
    pub fn reset(&mut self) {
        self.frame_buffer.clear();
        self.state = SlipState::Normal;
    }

    /// End of stream: discard the partial frame and report its size.
    ///
    /// There is no way to tell a truncated final frame from one that simply
    /// has not finished yet, so whatever is buffered is dropped.
    pub fn finish(&mut self) -> usize {
        let discarded = self.frame_buffer.len();
        self.reset();
        discarded
    }

    /// Process one byte from the link
    ///
    /// Returns `SlipEvent::Frame` when an unescaped `END` closes a frame.
    ///
    /// # Errors
    ///
    /// Returns `SlipError::InvalidEscape` in strict mode for a bad escape and
    /// `SlipError::FrameTooLong` when the frame outgrows the limit. In both
    /// cases the frame is dropped and bytes are ignored until the next `END`.
    pub fn feed_byte(&mut self, byte: u8) -> Result<SlipEvent, SlipError> {
        match self.state {
            SlipState::Normal => match byte {
                END => Ok(SlipEvent::Frame(self.take_frame())),
                ESC => {
                    self.state = SlipState::EscapePending;
                    Ok(SlipEvent::Accumulating)
                }
                _ => self.push(byte),
            },
            SlipState::EscapePending => {
                self.state = SlipState::Normal;
                match byte {
                    ESC_END => self.push(END),
                    ESC_ESC => self.push(ESC),
                    _ => match self.policy {
                        EscapePolicy::Permissive => {
                            log::debug!("Passing through byte {:#04x} after ESC", byte);
                            self.push(byte)
                        }
                        EscapePolicy::Strict => {
                            self.frame_buffer.clear();
                            // An END here still delimits, so there is nothing to skip
                            if byte != END {
                                self.state = SlipState::Discarding;
                            }
                            Err(SlipError::InvalidEscape { byte })
                        }
                    },
                }
            }
            SlipState::Discarding => {
                if byte == END {
                    self.state = SlipState::Normal;
                }
                Ok(SlipEvent::Accumulating)
            }
        }
    }

    /// Unescape one byte for callers that stream payload straight to a
    /// sink. Nothing is buffered, so the frame length limit does not apply.
    ///
    /// # Errors
    ///
    /// Returns `SlipError::InvalidEscape` in strict mode for a bad escape. The
    /// offending byte is consumed and the decoder returns to `Normal`.
    pub fn decode_byte(&mut self, byte: u8) -> Result<SlipByte, SlipError> {
        if self.state == SlipState::EscapePending {
            self.state = SlipState::Normal;
            return match byte {
                ESC_END => Ok(SlipByte::Data(END)),
                ESC_ESC => Ok(SlipByte::Data(ESC)),
                _ if self.policy == EscapePolicy::Strict => {
                    Err(SlipError::InvalidEscape { byte })
                }
                _ => {
                    log::debug!("Passing through byte {:#04x} after ESC", byte);
                    Ok(SlipByte::Data(byte))
                }
            };
        }

        self.state = SlipState::Normal;
        match byte {
            END => Ok(SlipByte::End),
            ESC => {
                self.state = SlipState::EscapePending;
                Ok(SlipByte::Pending)
            }
            _ => Ok(SlipByte::Data(byte)),
        }
    }

    fn push(&mut self, byte: u8) -> Result<SlipEvent, SlipError> {
        if self.frame_buffer.len() >= self.max_frame_len {
            log::warn!(
                "Dropping frame: exceeded {} byte limit",
                self.max_frame_len
            );
            self.frame_buffer.clear();
            self.state = SlipState::Discarding;
            return Err(SlipError::FrameTooLong {
                limit: self.max_frame_len,
            });
        }
        self.frame_buffer.push(byte);
        Ok(SlipEvent::Accumulating)
    }

    fn take_frame(&mut self) -> RawFrame {
        RawFrame(std::mem::take(&mut self.frame_buffer))
    }
}

/// Byte-stuff `payload` without adding delimiters
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(payload.len() + payload.len() / 8);
    for &byte in payload {
        match byte {
            END => encoded.extend_from_slice(&[ESC, ESC_END]),
            ESC => encoded.extend_from_slice(&[ESC, ESC_ESC]),
            _ => encoded.push(byte),
        }
    }
    encoded
}

/// Byte-stuff `payload` and terminate it with `END`
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut encoded = encode(payload);
    encoded.push(END);
    encoded
}
