//! The fixed size header in front of every frame.
//!
//! On the wire this is the payload length as a little endian u16, followed by the command as a little endian u16.
use bytes::{Buf, BufMut};

/// Size of the length field.
pub const HEADER_LEN_SIZE: usize = 2;

/// Size of the command field.
pub const HEADER_CMD_SIZE: usize = 2;

/// Size of the whole header.  The length field of a header never counts these bytes.
pub const HEADER_SIZE: usize = HEADER_LEN_SIZE + HEADER_CMD_SIZE;

/// Command of frames carrying normal application payloads.
pub const CMD_NORMAL: u16 = 0;

/// Largest payload a single frame can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd, Debug, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Header {
    /// Byte length of the payload following the header.
    pub length: u16,
    pub command: u16,
}

#[derive(Debug, derive_more::Display, thiserror::Error)]
#[non_exhaustive]
pub enum HeaderDecodingError {
    NotEnoughData,
}

impl Header {
    /// Total number of bytes the frame behind this header occupies, header included.
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }

    pub fn encode(&self, dest: &mut impl BufMut) {
        dest.put_u16_le(self.length);
        dest.put_u16_le(self.command);
    }

    pub fn decode(source: &mut impl Buf) -> Result<Header, HeaderDecodingError> {
        if source.remaining() < HEADER_SIZE {
            return Err(HeaderDecodingError::NotEnoughData);
        }

        let length = source.get_u16_le();
        let command = source.get_u16_le();

        Ok(Header { length, command })
    }
}
