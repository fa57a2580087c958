use bytes::BufMut;

use crate::header::{Header, MAX_PAYLOAD_LEN};

#[derive(Debug, derive_more::Display, thiserror::Error)]
#[non_exhaustive]
pub enum FramerError {
    /// The payload doesn't fit in the u16 length field.
    #[display(fmt = "payload of {} bytes is longer than {}", _0, MAX_PAYLOAD_LEN)]
    PayloadTooLong(usize),
}

/// Write one frame (header, then payload) to `dest`.
pub fn encode_frame(command: u16, payload: &[u8], dest: &mut impl BufMut) -> Result<(), FramerError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FramerError::PayloadTooLong(payload.len()));
    }

    let header = Header {
        length: payload.len() as u16,
        command,
    };
    header.encode(dest);
    dest.put_slice(payload);
    Ok(())
}

/// A framer writes frames to an internal buffer, then hands them out on request.
///
/// To use, call [Framer::add_frame] repeatedly, then [Framer::get_data], then [Framer::clear].  The general pattern
/// here is to build up a batch of frames, hand the bytes to a single transport write, then repeat.
pub struct Framer {
    cap_limit: usize,
    buffer: Vec<u8>,
}

impl Framer {
    /// Create a framer.
    ///
    /// `cap_limit` is the maximum capacity of the internal buffer after clearing, so that one large batch doesn't pin
    /// its memory forever.
    pub fn new(cap_limit: usize) -> Framer {
        Framer {
            cap_limit,
            buffer: Vec::with_capacity(cap_limit),
        }
    }

    /// Clear the internal buffer to write a new batch of frames.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.buffer.shrink_to(self.cap_limit);
    }

    /// Append a frame.  On error nothing is written.
    pub fn add_frame(&mut self, command: u16, payload: &[u8]) -> Result<(), FramerError> {
        encode_frame(command, payload, &mut self.buffer)
    }

    /// Read the data of all frames in the framer.
    pub fn get_data(&self) -> &[u8] {
        &self.buffer[..]
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
