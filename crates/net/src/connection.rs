use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use log::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;

use tcpsock_framer::{encode_frame, HEADER_SIZE, RECV_BUF_LEN_MAX};

use crate::error::ConnectionError;
use crate::session::Session;

/// Process-wide source of connection identities.  Server and client connections draw from the same counter, so an id
/// is never handed out twice while the process lives.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(derivative::Derivative, Debug, Clone)]
#[derivative(Default)]
pub struct ConnectionConfig {
    /// Maximum number of inbound bytes a connection may hold while waiting for a frame to complete.
    ///
    /// A peer pushing past this gets disconnected.
    #[derivative(Default(value = "RECV_BUF_LEN_MAX"))]
    pub recv_buf_len_max: usize,

    /// Size of the buffer handed to each socket read.
    #[derivative(Default(value = "4096"))]
    pub read_chunk_size: usize,

    #[derivative(Default(value = "true"))]
    pub nodelay: bool,

    /// Maximum number of bytes which may be queued but unsent before the connection is shut down.
    ///
    /// When exceeded, the write fails and the connection closes without flushing.
    #[derivative(Default(value = "1<<20"))]
    pub max_unsent_bytes: usize,

    /// Timeout on individual write calls.  A write that takes longer closes the connection.
    #[derivative(Default(value = "Duration::from_millis(500)"))]
    pub write_timeout: Duration,
}

/// Lifecycle of a connection.  Only ever moves forward.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    /// Something asked the connection to go away; its task is winding down.
    Closing = 1,
    /// The task has exited and the owner has been told.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One TCP stream, shared between its task and whoever wants to write to it or close it.
///
/// Bytes passed to [Connection::write] go out verbatim; framing them is up to the caller.  Reads happen on the
/// connection's own task, which hands every chunk to the bound [Session].
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    config: ConnectionConfig,
    state: AtomicU8,
    outgoing: mpsc::UnboundedSender<Bytes>,
    unsent: AtomicUsize,
    backlogged: AtomicBool,
    close_requested: Notify,
}

/// Run by the connection's task exactly once, after the stream is done with.
pub(crate) type CloseCallback = Box<dyn FnOnce(&Arc<Connection>) + Send + 'static>;

/// The half of a connection which owns the socket.  Consumed by running it.
pub(crate) struct ConnectionDriver {
    connection: Arc<Connection>,
    stream: TcpStream,
    outgoing: mpsc::UnboundedReceiver<Bytes>,
}

#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    Read(std::io::Error),
    Write(std::io::Error),
    WriteTimeout,
    Backlogged,
    Receive(anyhow::Error),
    Local,
    Shutdown,
}

impl Connection {
    pub(crate) fn new(id: u64, stream: TcpStream, config: ConnectionConfig) -> std::io::Result<ConnectionDriver> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(config.nodelay)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            id,
            peer_addr,
            local_addr,
            config,
            state: AtomicU8::new(ConnectionState::Open as u8),
            outgoing: sender,
            unsent: AtomicUsize::new(0),
            backlogged: AtomicBool::new(false),
            close_requested: Notify::new(),
        });

        Ok(ConnectionDriver {
            connection,
            stream,
            outgoing: receiver,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queue bytes for the peer.
    ///
    /// Fails with [ConnectionError::Closed] once the connection has started closing.  Fails with
    /// [ConnectionError::Backlogged], closing the connection, when the peer has fallen more than
    /// [ConnectionConfig::max_unsent_bytes] behind.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.enqueue(Bytes::copy_from_slice(data))
    }

    /// Frame `payload` under `command` and queue the frame for the peer.
    pub fn write_frame(&self, command: u16, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        encode_frame(command, payload, &mut buf)?;
        self.enqueue(buf.freeze())
    }

    /// Ask the connection to close.  Anything already queued is still flushed.
    ///
    /// Safe to call any number of times, from anywhere; the owner hears about the closure once.
    pub fn close(&self) {
        if self.begin_closing() {
            debug!("Closing connection {} to {}", self.id, self.peer_addr);
            self.close_requested.notify_one();
        }
    }

    fn enqueue(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(self.closed_error().into());
        }

        let len = data.len();
        let unsent = self.unsent.fetch_add(len, Ordering::AcqRel) + len;
        if unsent > self.config.max_unsent_bytes {
            self.unsent.fetch_sub(len, Ordering::AcqRel);
            warn!(
                "Connection {} to {} is {} bytes behind, closing",
                self.id, self.peer_addr, unsent
            );
            self.backlogged.store(true, Ordering::Release);
            self.close();
            return Err(ConnectionError::Backlogged {
                id: self.id,
                peer: self.peer_addr,
                unsent,
                max: self.config.max_unsent_bytes,
            }
            .into());
        }

        if self.outgoing.send(data).is_err() {
            self.unsent.fetch_sub(len, Ordering::AcqRel);
            return Err(self.closed_error().into());
        }
        Ok(())
    }

    /// Bytes queued for the peer which the connection's task hasn't picked up yet.
    pub fn unsent_bytes(&self) -> usize {
        self.unsent.load(Ordering::Acquire)
    }

    /// Move from open to closing.  Returns whether this call did it.
    fn begin_closing(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn closed_error(&self) -> ConnectionError {
        ConnectionError::Closed {
            id: self.id,
            peer: self.peer_addr,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionDriver {
    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Drive the connection until the peer goes away, the session fails, someone calls [Connection::close], or
    /// `shutdown` fires.  `on_close` runs once on the way out, before the connection is marked closed.
    ///
    /// Every write is bounded by `write_timeout`, so a peer which stops reading can't hold the task up.
    pub(crate) async fn run(
        self,
        session: Option<Arc<dyn Session>>,
        mut shutdown: watch::Receiver<bool>,
        on_close: CloseCallback,
    ) {
        let ConnectionDriver {
            connection,
            stream,
            mut outgoing,
        } = self;
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; connection.config.read_chunk_size.max(1)];
        let write_timeout = connection.config.write_timeout;

        let shut_down_early = *shutdown.borrow();
        let reason = if shut_down_early {
            CloseReason::Shutdown
        } else {
            loop {
                tokio::select! {
                    res = reader.read(&mut buf) => match res {
                        Ok(0) => break CloseReason::PeerClosed,
                        Ok(n) => match &session {
                            Some(s) => {
                                if let Err(e) = s.receive(&buf[..n]) {
                                    break CloseReason::Receive(e);
                                }
                            }
                            None => trace!("Connection {} has no session, dropping {} bytes", connection.id, n),
                        },
                        Err(e) => break CloseReason::Read(e),
                    },
                    Some(data) = outgoing.recv() => {
                        connection.unsent.fetch_sub(data.len(), Ordering::AcqRel);
                        match timeout(write_timeout, writer.write_all(&data)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break CloseReason::Write(e),
                            Err(_) => break CloseReason::WriteTimeout,
                        }
                    }
                    _ = connection.close_requested.notified() => {
                        if connection.backlogged.load(Ordering::Acquire) {
                            break CloseReason::Backlogged;
                        }
                        break CloseReason::Local;
                    }
                    _ = shutdown.changed() => break CloseReason::Shutdown,
                }
            }
        };

        connection.begin_closing();
        outgoing.close();
        if matches!(reason, CloseReason::Local | CloseReason::Shutdown) {
            while let Ok(data) = outgoing.try_recv() {
                connection.unsent.fetch_sub(data.len(), Ordering::AcqRel);
                if !matches!(timeout(write_timeout, writer.write_all(&data)).await, Ok(Ok(()))) {
                    break;
                }
            }
        }
        let _ = timeout(write_timeout, writer.shutdown()).await;

        debug!(
            "Connection {} to {} closed: {:?}",
            connection.id, connection.peer_addr, reason
        );
        on_close(&connection);
        connection
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use tokio::net::TcpListener;

    struct Recorder {
        id: u64,
        seen: Mutex<Vec<u8>>,
    }

    impl Session for Recorder {
        fn id(&self) -> u64 {
            self.id
        }

        fn receive(&self, data: &[u8]) -> Result<usize> {
            self.seen.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn send(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_close_is_reported_once() {
        let (mut peer, ours) = pair().await;
        let driver = Connection::new(next_connection_id(), ours, Default::default()).unwrap();
        let connection = driver.connection().clone();
        let recorder = Arc::new(Recorder {
            id: connection.id(),
            seen: Mutex::new(vec![]),
        });
        let closes = Arc::new(AtomicUsize::new(0));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let closes_cb = closes.clone();
        let task = tokio::spawn(driver.run(
            Some(recorder.clone()),
            shutdown_rx,
            Box::new(move |_| {
                closes_cb.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        peer.write_all(b"hello").await.unwrap();
        connection.write(b"back").unwrap();
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"back");

        while recorder.seen.lock().unwrap().len() < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(&recorder.seen.lock().unwrap()[..], b"hello");

        connection.close();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closing);
        assert!(connection.write(b"late").is_err());

        task.await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(connection.state(), ConnectionState::Closed);

        // The peer sees an orderly shutdown.
        let mut rest = vec![];
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_peer_hangup_closes() {
        let (peer, ours) = pair().await;
        let driver = Connection::new(next_connection_id(), ours, Default::default()).unwrap();
        let connection = driver.connection().clone();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(driver.run(None, shutdown_rx, Box::new(|_| {})));
        drop(peer);
        task.await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.write(b"x").is_err());
    }

    #[tokio::test]
    async fn test_backlog_closes() {
        let (_peer, ours) = pair().await;
        let config = ConnectionConfig {
            max_unsent_bytes: 8,
            ..Default::default()
        };
        let driver = Connection::new(next_connection_id(), ours, config).unwrap();
        let connection = driver.connection().clone();

        connection.write(b"12345678").unwrap();
        assert_eq!(connection.unsent_bytes(), 8);
        let err = connection.write(b"9").err().expect("should be backlogged");
        assert!(matches!(
            err.downcast_ref::<ConnectionError>(),
            Some(ConnectionError::Backlogged { unsent: 9, max: 8, .. })
        ));
        assert_eq!(connection.unsent_bytes(), 8);
        assert_eq!(connection.state(), ConnectionState::Closing);

        // The task winds down on its own, without waiting on the peer.
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        driver.run(None, shutdown_rx, Box::new(|_| {})).await;
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_stuck_write_times_out() {
        let (_peer, ours) = pair().await;
        let config = ConnectionConfig {
            max_unsent_bytes: 64 << 20,
            write_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let driver = Connection::new(next_connection_id(), ours, config).unwrap();
        let connection = driver.connection().clone();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // More than the socket buffers on both ends hold, and the peer never reads.
        connection.write(&vec![7u8; 32 << 20]).unwrap();
        tokio::time::timeout(Duration::from_secs(5), driver.run(None, shutdown_rx, Box::new(|_| {})))
            .await
            .expect("stuck write should time out");
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_ids_increase() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }
}
