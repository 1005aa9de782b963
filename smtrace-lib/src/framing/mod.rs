//! SML transport framing.
//!
//! A telegram on the wire looks like
//!
//! ```text
//! 1b 1b 1b 1b 01 01 01 01 <messages> <0..3 x 00> 1b 1b 1b 1b 1a <pad> <crc lo> <crc hi>
//! ```
//!
//! where any `1b 1b 1b 1b` inside the messages is escaped by doubling it.
mod extractor;

pub use extractor::*;

use crate::{Error, Result};
use crc::{Crc, CRC_16_IBM_SDLC};

/// Four escape octets, the prefix of every marker.
pub const ESCAPE: [u8; 4] = [0x1b; 4];
/// Start-of-telegram marker.
pub const START: [u8; 8] = [0x1b, 0x1b, 0x1b, 0x1b, 0x01, 0x01, 0x01, 0x01];
/// Leading part of the end-of-telegram marker. It is followed by the padding count
/// and two checksum octets.
pub const END: [u8; 5] = [0x1b, 0x1b, 0x1b, 0x1b, 0x1a];
/// Length of the complete end marker including padding count and checksum.
pub const END_LEN: usize = END.len() + 3;
/// Largest valid padding count.
pub const MAX_PADDING: u8 = 3;

/// CRC-16/X-25, as used by the SML transport layer.
const X25: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// A complete SML telegram, both markers included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
}

impl Frame {
    /// Minimum frame length: start marker plus end marker.
    pub const MIN_LEN: usize = START.len() + END_LEN;

    pub(crate) fn new(data: Vec<u8>) -> Self {
        debug_assert!(data.len() >= Self::MIN_LEN);
        Frame { data }
    }

    /// Build a telegram around `message`, escaping, padding and checksumming it the
    /// way a meter does.
    ///
    /// # Example
    /// ```
    /// use smtrace::framing::{Frame, FrameExtractor};
    ///
    /// let frame = Frame::encode(&[0x76, 0x05, 0x01, 0x02]);
    /// let mut extractor = FrameExtractor::new();
    /// let extracted = extractor.feed(frame.as_bytes());
    /// assert_eq!(extracted.frames, vec![frame]);
    /// ```
    #[must_use]
    pub fn encode(message: &[u8]) -> Self {
        let mut data = Vec::with_capacity(Self::MIN_LEN + message.len() + 4);
        data.extend_from_slice(&START);
        let mut i = 0;
        while i < message.len() {
            if message[i..].starts_with(&ESCAPE) {
                data.extend_from_slice(&ESCAPE);
                data.extend_from_slice(&ESCAPE);
                i += ESCAPE.len();
            } else {
                data.push(message[i]);
                i += 1;
            }
        }
        let padding = (4 - (data.len() - START.len()) % 4) % 4;
        data.resize(data.len() + padding, 0x00);
        data.extend_from_slice(&END);
        data.push(padding as u8);
        let crc = X25.checksum(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Frame { data }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of fill octets appended to the messages (the checksum-class octet).
    #[must_use]
    pub fn padding(&self) -> u8 {
        self.data[self.data.len() - 3]
    }

    /// The checksum transmitted with the frame.
    #[must_use]
    pub fn checksum(&self) -> u16 {
        let n = self.data.len();
        u16::from_le_bytes([self.data[n - 2], self.data[n - 1]])
    }

    /// Check the transmitted CRC-16/X-25 against the frame contents.
    ///
    /// # Errors
    /// [Error::Checksum] if they differ.
    pub fn verify_crc(&self) -> Result<()> {
        let actual = X25.checksum(&self.data[..self.data.len() - 2]);
        let expected = self.checksum();
        if actual != expected {
            return Err(Error::Checksum { expected, actual });
        }
        Ok(())
    }

    /// The message bytes between the markers with padding removed and escape
    /// sequences collapsed.
    #[must_use]
    pub fn message(&self) -> Vec<u8> {
        let body = &self.data[START.len()..self.data.len() - END_LEN];
        let body = &body[..body.len().saturating_sub(self.padding() as usize)];

        let mut out = Vec::with_capacity(body.len());
        let mut i = 0;
        while i < body.len() {
            if body[i..].starts_with(&ESCAPE) && body[i + ESCAPE.len()..].starts_with(&ESCAPE) {
                out.extend_from_slice(&ESCAPE);
                i += 2 * ESCAPE.len();
            } else {
                out.push(body[i]);
                i += 1;
            }
        }
        out
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
