use std::sync::Arc;

use anyhow::Result;
use log::*;
use tokio::net::TcpStream;

use crate::base::SocketBase;
use crate::connection::{next_connection_id, Connection, ConnectionConfig};
use crate::error::ConfigError;
use crate::message_handling::ConnectionHandler;
use crate::session::Session;

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct ClientConfig {
    /// Address to connect to.  Anything `TcpStream::connect` resolves works, e.g. `localhost:7000`.
    #[builder(setter(into))]
    address: String,

    #[builder(default = "Default::default()")]
    connection: ConnectionConfig,
}

/// One outbound connection, driven the same way as a server-side one.
///
/// The handler's `on_connect` runs before [Client::connect] returns; `on_disconnect` runs on the connection's task
/// when it goes away.  There is no admission check and no registry.
///
/// Dropping the client closes the connection without waiting for it.
pub struct Client {
    connection: Arc<Connection>,
    session: Option<Arc<dyn Session>>,
    base: SocketBase,
}

impl Client {
    /// Connect and start the connection's task.  Needs a Tokio runtime.
    ///
    /// An empty address or a failed connect is a [ConfigError].
    pub async fn connect<H: ConnectionHandler>(config: ClientConfig, handler: H) -> Result<Client> {
        if config.address.is_empty() {
            return Err(ConfigError::EmptyAddress.into());
        }

        let stream = TcpStream::connect(config.address.as_str())
            .await
            .map_err(|source| ConfigError::Connect {
                address: config.address.clone(),
                source,
            })?;
        let driver = Connection::new(next_connection_id(), stream, config.connection)?;
        let connection = driver.connection().clone();
        debug!(
            "Connection {} established to {}",
            connection.id(),
            connection.peer_addr()
        );

        let base = SocketBase::new();
        let session = handler.on_connect(&connection);
        if let Some(guard) = base.track() {
            let shutdown = base.subscribe();
            let task_session = session.clone();
            tokio::spawn(async move {
                let _guard = guard;
                driver
                    .run(
                        task_session,
                        shutdown,
                        Box::new(move |conn| handler.on_disconnect(conn)),
                    )
                    .await;
            });
        }

        Ok(Client {
            connection,
            session,
            base,
        })
    }

    pub fn id(&self) -> u64 {
        self.connection.id()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The session `on_connect` handed back, if any.
    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.session.as_ref()
    }

    /// Send bytes to the server as they are.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.connection.write(data)
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Close the connection and wait for its task to exit.  `on_disconnect` has run once this returns.
    pub async fn close(&self) {
        self.connection.close();
        self.base.shutdown().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.close();
    }
}
