use crate::header::{Header, HEADER_SIZE};

/// Default upper bound on the bytes a [Reassembler] holds at once.
pub const RECV_BUF_LEN_MAX: usize = 16 * 1024;

/// A complete frame, borrowed from the reassembler that produced it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Frame<'a> {
    pub command: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, derive_more::Display, thiserror::Error)]
#[non_exhaustive]
pub enum ReassemblerError {
    /// Appending the chunk would grow the buffer past its limit.  Nothing was appended.
    #[display(fmt = "{} buffered + {} incoming bytes exceeds limit of {}", buffered, incoming, max)]
    BufferOverflow { buffered: usize, incoming: usize, max: usize },

    /// A header announced a frame which can never fit in the buffer.  The stream can't be resynchronised after this,
    /// so everything buffered was thrown away.
    #[display(fmt = "frame of {} bytes exceeds limit of {}", frame_size, max)]
    FrameTooLong { frame_size: usize, max: usize },
}

/// Per-connection state turning a stream of arbitrarily split chunks back into frames.
///
/// To use, call [Reassembler::feed] with a chunk, then call [Reassembler::next_frame] until it returns `None`.  Or call
/// [Reassembler::consume] which does both.  One chunk can complete zero, one, or many frames; a frame is only handed
/// out once all `HEADER_SIZE + length` of its bytes are buffered.
///
/// The buffer only ever holds bytes which aren't part of a handed out frame, and never more than `max_len` of them.
/// When it drains completely its allocation is released.
#[derive(Debug)]
pub struct Reassembler {
    max_len: usize,
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` which belong to frames already handed out.
    consumed: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler::new(RECV_BUF_LEN_MAX)
    }
}

impl Reassembler {
    pub fn new(max_len: usize) -> Reassembler {
        Reassembler {
            max_len,
            buffer: Vec::new(),
            consumed: 0,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Number of bytes waiting to become part of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Append a chunk of inbound data.
    ///
    /// Fails without touching the buffer if the unconsumed bytes plus the chunk would exceed the limit.  Callers should
    /// treat that as fatal for the stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), ReassemblerError> {
        self.compact();

        let buffered = self.buffer.len();
        if buffered + chunk.len() > self.max_len {
            return Err(ReassemblerError::BufferOverflow {
                buffered,
                incoming: chunk.len(),
                max: self.max_len,
            });
        }

        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Take the next complete frame out of the buffer, if there is one.
    ///
    /// Returns `Ok(None)` when more data is needed, after dropping the bytes of every frame handed out so far.
    pub fn next_frame(&mut self) -> Result<Option<Frame<'_>>, ReassemblerError> {
        let mut pending = &self.buffer[self.consumed..];
        // A bare header is a whole frame with an empty payload, so exactly HEADER_SIZE bytes is enough.
        if pending.len() < HEADER_SIZE {
            self.compact();
            return Ok(None);
        }

        let header = match Header::decode(&mut pending) {
            Ok(h) => h,
            Err(_) => {
                self.compact();
                return Ok(None);
            }
        };

        let frame_size = header.frame_size();
        if frame_size > self.max_len {
            log::debug!(
                "Discarding {} buffered bytes after a {} byte frame header",
                self.buffered_len(),
                frame_size
            );
            self.buffer = Vec::new();
            self.consumed = 0;
            return Err(ReassemblerError::FrameTooLong {
                frame_size,
                max: self.max_len,
            });
        }

        if self.buffered_len() < frame_size {
            self.compact();
            return Ok(None);
        }

        let start = self.consumed + HEADER_SIZE;
        let end = self.consumed + frame_size;
        self.consumed = end;

        Ok(Some(Frame {
            command: header.command,
            payload: &self.buffer[start..end],
        }))
    }

    /// Feed a chunk and hand every frame it completes to `on_frame`, in order.
    ///
    /// Returns how many frames were handed out.  On [ReassemblerError::FrameTooLong] the frames before the bad header
    /// have already been delivered.
    pub fn consume(
        &mut self,
        chunk: &[u8],
        mut on_frame: impl FnMut(Frame<'_>),
    ) -> Result<usize, ReassemblerError> {
        self.feed(chunk)?;

        let mut delivered = 0;
        while let Some(frame) = self.next_frame()? {
            on_frame(frame);
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Drop consumed bytes from the front of the buffer, releasing it entirely once empty.
    fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }

        if self.consumed == self.buffer.len() {
            self.buffer = Vec::new();
        } else {
            self.buffer.drain(..self.consumed);
        }
        self.consumed = 0;
    }
}
