use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use log::*;
use tokio::net::{TcpListener, TcpStream};

use crate::base::{SocketBase, TaskGuard};
use crate::connection::{next_connection_id, Connection, ConnectionConfig};
use crate::error::{ConfigError, ServerError};
use crate::message_handling::ConnectionHandler;
use crate::session::Session;

/// Default cap on live connections.
pub const NUM_OF_CONN_MAX: u32 = 10000;

/// Default capacity the session registry starts with.
pub const NUM_OF_CONN_INIT: usize = 100;

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `127.0.0.1:7000`.  Port 0 picks a free port; see [Server::local_addr].
    #[builder(setter(into))]
    address: String,

    /// Maximum number of connections which may be open at any one time.
    ///
    /// Sockets accepted past this are closed straight away.
    #[builder(default = "NUM_OF_CONN_MAX")]
    max_connections: u32,

    #[builder(default = "NUM_OF_CONN_INIT")]
    initial_capacity: usize,

    #[builder(default = "Default::default()")]
    connection: ConnectionConfig,
}

/// A TCP server.
///
/// Accepts sockets on a background task, runs each accepted connection on a task of its own, and keeps a registry of
/// the sessions the [ConnectionHandler] handed back so other tasks can reach them by id.
///
/// [Server::kick] only forgets the session: the socket stays up until the peer goes away or someone closes the
/// [Connection].  A kicked peer can keep sending in the meantime.
pub struct Server<H> {
    config: ServerConfig,
    handler: Arc<H>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    base: SocketBase,
    count: AtomicU32,
    sessions: Mutex<HashMap<u64, Arc<dyn Session>>>,
}

impl<H: ConnectionHandler> Server<H> {
    /// Bind the listening socket.  Nothing is accepted until [Server::serve].
    ///
    /// Failures here are [ConfigError]s.
    pub async fn bind(config: ServerConfig, handler: H) -> Result<Arc<Server<H>>> {
        if config.address.is_empty() {
            return Err(ConfigError::EmptyAddress.into());
        }

        let listener = TcpListener::bind(config.address.as_str())
            .await
            .map_err(|source| ConfigError::Bind {
                address: config.address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        debug!("Server listening on {}", local_addr);

        Ok(Arc::new(Server {
            sessions: Mutex::new(HashMap::with_capacity(config.initial_capacity)),
            handler: Arc::new(handler),
            local_addr,
            listener: Mutex::new(Some(listener)),
            base: SocketBase::new(),
            count: AtomicU32::new(0),
            config,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Start accepting on a background task and return straight away.  Needs a Tokio runtime.
    pub fn serve(self: &Arc<Self>) -> Result<()> {
        let listener = lock(&self.listener).take();
        let (listener, guard) = match (listener, self.base.track()) {
            (Some(l), Some(g)) => (l, g),
            _ => return Err(ServerError::AlreadyServing.into()),
        };

        tokio::spawn(self.clone().listening_loop(listener, guard));
        Ok(())
    }

    /// Stop accepting, close every connection, and wait for all of the server's tasks to exit.
    ///
    /// Once this returns the connection count is zero and the registry is empty.
    pub async fn close(&self) {
        drop(lock(&self.listener).take());
        self.base.shutdown().await;
    }

    /// Number of live connections.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Call `f` with every registered session.
    ///
    /// `f` sees a snapshot taken under the registry lock and runs after the lock is released, so it may call back into
    /// the server.  Sessions registered or removed meanwhile may or may not be visited.
    pub fn iterate(&self, mut f: impl FnMut(u64, &Arc<dyn Session>)) {
        for (id, session) in self.snapshot() {
            f(id, &session);
        }
    }

    /// Send bytes to one session.  Does nothing if `id` isn't registered.
    pub fn send(&self, id: u64, data: &[u8]) -> Result<()> {
        let session = self.sessions().get(&id).cloned();
        match session {
            Some(s) => s.send(data),
            None => {
                trace!("No session {} to send to", id);
                Ok(())
            }
        }
    }

    /// Send bytes to every registered session.  Failures for one session don't stop the others.
    pub fn broadcast(&self, data: &[u8]) {
        self.iterate(|id, session| {
            if let Err(e) = session.send(data) {
                debug!("Broadcast to session {} failed: {:#}", id, e);
            }
        });
    }

    /// Forget the session registered under `id`.  The connection itself stays open.
    pub fn kick(&self, id: u64) {
        if self.sessions().remove(&id).is_some() {
            debug!("Kicked session {}", id);
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions().contains_key(&id)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn Session>>> {
        lock(&self.sessions)
    }

    fn snapshot(&self) -> Vec<(u64, Arc<dyn Session>)> {
        self.sessions()
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }

    async fn listening_loop(self: Arc<Self>, listener: TcpListener, _guard: TaskGuard) {
        let mut shutdown = self.base.subscribe();

        while !self.base.is_shutting_down() {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.changed() => break,
            };

            let (stream, peer) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("Accept on {} failed: {}", self.local_addr, e);
                    continue;
                }
            };

            if !self.admit(peer) {
                drop(stream);
                continue;
            }

            self.spawn_connection(stream, peer);
        }

        debug!("Server on {} stopped accepting", self.local_addr);
    }

    fn admit(&self, peer: SocketAddr) -> bool {
        if self.count() >= self.config.max_connections {
            warn!(
                "Rejecting {}: {} connections already open",
                peer, self.config.max_connections
            );
            return false;
        }

        if !self.handler.check_ip(peer) {
            debug!("Rejecting {}: address refused", peer);
            return false;
        }

        true
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let guard = match self.base.track() {
            Some(g) => g,
            None => return,
        };

        let id = next_connection_id();
        self.count.fetch_add(1, Ordering::AcqRel);

        let server = self.clone();
        tokio::spawn(async move {
            let _guard = guard;

            let driver = match Connection::new(id, stream, server.config.connection.clone()) {
                Ok(d) => d,
                Err(e) => {
                    debug!("Dropping connection from {}: {}", peer, e);
                    server.count.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };
            debug!("Accepted connection {} from {}", id, peer);

            let session = server.handler.on_connect(driver.connection());
            if let Some(s) = &session {
                server.sessions().insert(id, s.clone());
            }

            let shutdown = server.base.subscribe();
            let on_close_server = server.clone();
            driver
                .run(
                    session,
                    shutdown,
                    Box::new(move |conn| on_close_server.connection_closed(conn)),
                )
                .await;
        });
    }

    fn connection_closed(&self, connection: &Arc<Connection>) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.handler.on_disconnect(connection);
        self.sessions().remove(&connection.id());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
