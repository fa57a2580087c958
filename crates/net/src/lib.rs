//! A small TCP socket engine.
//!
//! A [Server] accepts connections and runs each on its own task; a [Client] does the same for one outbound connection.
//! Every [Connection] feeds its inbound bytes to a [Session] supplied by the application's [ConnectionHandler], and the
//! server keeps those sessions in a registry for targeted sends, broadcasts, and kicks.
//!
//! The engine moves bytes.  [FramedSession] layers the length-prefixed frame protocol of `tcpsock_framer` on top,
//! handing each complete normal frame to a [FrameHandler].
mod base;
mod client;
mod connection;
mod error;
mod message_handling;
mod server;
mod session;

pub use client::*;
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use error::*;
pub use message_handling::*;
pub use server::*;
pub use session::*;
