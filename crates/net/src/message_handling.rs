use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use log::*;

use tcpsock_framer::{Reassembler, CMD_NORMAL};

use crate::connection::Connection;
use crate::session::Session;

/// Lifecycle callbacks of an application, shared by the [Server](crate::Server) and the [Client](crate::Client).
///
/// Both callbacks run on the connection's own task.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A connection came up.  Return a session to receive its bytes and make it reachable by id, or `None` to leave
    /// it unrouted; the bytes of an unrouted connection are read and dropped.
    fn on_connect(&self, connection: &Arc<Connection>) -> Option<Arc<dyn Session>>;

    /// The connection is gone, whoever closed it.  Runs exactly once per connection.
    fn on_disconnect(&self, connection: &Arc<Connection>);

    /// Admission check on the peer address of a freshly accepted socket.  Rejected sockets are closed before any
    /// callback fires.  Only the server asks.
    fn check_ip(&self, _peer: SocketAddr) -> bool {
        true
    }
}

impl<T: ConnectionHandler> ConnectionHandler for Arc<T> {
    fn on_connect(&self, connection: &Arc<Connection>) -> Option<Arc<dyn Session>> {
        (**self).on_connect(connection)
    }

    fn on_disconnect(&self, connection: &Arc<Connection>) {
        (**self).on_disconnect(connection)
    }

    fn check_ip(&self, peer: SocketAddr) -> bool {
        (**self).check_ip(peer)
    }
}

/// Handles the payloads of complete [CMD_NORMAL] frames for a [FramedSession].
pub trait FrameHandler: Send + Sync + 'static {
    /// Called once per frame, in arrival order.  An error disconnects the peer.
    fn handle_payload(&self, connection: &Connection, payload: &[u8]) -> Result<()>;
}

/// A [Session] speaking the length-prefixed frame protocol.
///
/// Inbound chunks are reassembled into frames; normal frames go to the handler, frames with any other command are
/// skipped.  Overflowing the connection's `recv_buf_len_max`, or announcing a frame that could never fit in it, fails
/// the session and so closes the connection.
pub struct FramedSession<H> {
    connection: Arc<Connection>,
    reassembler: Mutex<Reassembler>,
    handler: H,
}

impl<H: FrameHandler> FramedSession<H> {
    pub fn new(connection: Arc<Connection>, handler: H) -> Arc<FramedSession<H>> {
        let reassembler = Reassembler::new(connection.config().recv_buf_len_max);
        Arc::new(FramedSession {
            connection,
            reassembler: Mutex::new(reassembler),
            handler,
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Frame a payload as [CMD_NORMAL] and send it.
    pub fn send_payload(&self, payload: &[u8]) -> Result<()> {
        self.connection.write_frame(CMD_NORMAL, payload)
    }
}

impl<H: FrameHandler> Session for FramedSession<H> {
    fn id(&self) -> u64 {
        self.connection.id()
    }

    fn receive(&self, data: &[u8]) -> Result<usize> {
        let mut reassembler = self.reassembler.lock().unwrap_or_else(PoisonError::into_inner);
        reassembler.feed(data)?;

        while let Some(frame) = reassembler.next_frame()? {
            if frame.command == CMD_NORMAL {
                self.handler.handle_payload(&self.connection, frame.payload)?;
            } else {
                trace!(
                    "Connection {} skipping frame with command {}",
                    self.connection.id(),
                    frame.command
                );
            }
        }

        Ok(data.len())
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        self.connection.write(data)
    }
}
