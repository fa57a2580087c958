use anyhow::Result;

/// The per-connection handler an application hands back from
/// [ConnectionHandler::on_connect](crate::ConnectionHandler::on_connect).
///
/// The engine treats sessions as opaque: it feeds them inbound bytes from the connection's task, and routes
/// [Server::send](crate::Server::send) calls to them.  Sessions are shared between the connection task and the
/// server's registry, so state must live behind interior mutability.
pub trait Session: Send + Sync + 'static {
    /// Identity of the connection this session is bound to.
    fn id(&self) -> u64;

    /// Handle a chunk of raw inbound bytes, returning how many were consumed.
    ///
    /// Chunks arrive in stream order, split wherever the transport split them.  Returning an error tears the connection
    /// down.
    fn receive(&self, data: &[u8]) -> Result<usize>;

    /// Send bytes to the peer as they are.
    fn send(&self, data: &[u8]) -> Result<()>;
}
