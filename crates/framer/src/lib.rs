//! This crate frames messages and reassembles framed messages out of a byte stream.  Encode with a [Framer] (or
//! [encode_frame]) and decode with a [Reassembler].
//!
//! A frame on the wire is a 4 byte header followed by the payload:
//!
//! ```text
//! offset 0: length   (u16, little endian) -- byte length of the payload
//! offset 2: command  (u16, little endian) -- frame type selector
//! offset 4: payload  (length bytes)
//! ```
//!
//! Only [CMD_NORMAL] carries application payloads.  Other commands are reserved; the reassembler hands them out like
//! any other frame and it is up to the consumer to skip them.  Message types of the application itself live inside the
//! payload and this crate knows nothing about them.
mod framer;
mod header;
mod reassembler;

pub use framer::*;
pub use header::*;
pub use reassembler::*;
