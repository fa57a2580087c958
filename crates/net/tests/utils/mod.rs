#![allow(dead_code)]
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

use tcpsock_framer::{encode_frame, Header, CMD_NORMAL, HEADER_SIZE};
use tcpsock_net::*;

/// Records everything the engine tells it, echoing normal payloads back to the peer.
#[derive(Default)]
pub struct TestHandler {
    pub connects: Mutex<Vec<u64>>,
    pub disconnects: Mutex<Vec<u64>>,
    pub registered: Mutex<Vec<u64>>,
    pub payloads: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    /// Which connections (by connect order) get a session.  `None` means all of them.
    pub register_every: Option<usize>,
    pub refuse_all: bool,
    pub echo: bool,
    pub seen: AtomicUsize,
}

impl TestHandler {
    pub fn echoing() -> Arc<TestHandler> {
        Arc::new(TestHandler {
            echo: true,
            ..Default::default()
        })
    }

    pub fn connects(&self) -> Vec<u64> {
        self.connects.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<u64> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<(u64, Vec<u8>)> {
        self.payloads.lock().unwrap().clone()
    }
}

struct Echo {
    payloads: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    echo: bool,
}

impl FrameHandler for Echo {
    fn handle_payload(&self, connection: &Connection, payload: &[u8]) -> Result<()> {
        self.payloads
            .lock()
            .unwrap()
            .push((connection.id(), payload.to_vec()));
        if self.echo {
            connection.write_frame(CMD_NORMAL, payload)?;
        }
        Ok(())
    }
}

impl ConnectionHandler for TestHandler {
    fn on_connect(&self, connection: &Arc<Connection>) -> Option<Arc<dyn Session>> {
        self.connects.lock().unwrap().push(connection.id());

        let nth = self.seen.fetch_add(1, Ordering::SeqCst);
        if let Some(every) = self.register_every {
            if nth % every != 0 {
                return None;
            }
        }

        self.registered.lock().unwrap().push(connection.id());
        Some(FramedSession::new(
            connection.clone(),
            Echo {
                payloads: self.payloads.clone(),
                echo: self.echo,
            },
        ))
    }

    fn on_disconnect(&self, connection: &Arc<Connection>) {
        self.disconnects.lock().unwrap().push(connection.id());
    }

    fn check_ip(&self, _peer: SocketAddr) -> bool {
        !self.refuse_all
    }
}

pub fn server_config(max_connections: u32) -> ServerConfig {
    ServerConfigBuilder::default()
        .address("127.0.0.1:0")
        .max_connections(max_connections)
        .build()
        .expect("Should build config")
}

pub async fn start_server<H: ConnectionHandler>(config: ServerConfig, handler: H) -> Result<Arc<Server<H>>> {
    tcpsock_logging::log_to_stderr();
    let server = Server::bind(config, handler).await?;
    server.serve()?;
    Ok(server)
}

pub fn registry_ids<H: ConnectionHandler>(server: &Server<H>) -> HashSet<u64> {
    let mut ids = HashSet::new();
    server.iterate(|id, _| {
        ids.insert(id);
    });
    ids
}

pub fn frame(command: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![];
    encode_frame(command, payload, &mut buf).expect("Should frame");
    buf
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<(u16, Vec<u8>)> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let header = Header::decode(&mut &header[..])?;
    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await?;
    Ok((header.command, payload))
}

pub async fn send_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    stream.write_all(&frame(CMD_NORMAL, payload)).await?;
    Ok(())
}

/// Wait for the peer to close the stream, discarding anything it still sends.
pub async fn wait_for_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        log::debug!("Looping while waiting for condition");
        sleep(Duration::from_millis(1)).await;
    }
}

/// Fail the test instead of hanging it.
pub async fn with_timeout<F: Future<Output = Result<()>>>(fut: F) {
    let res = tokio::time::timeout(Duration::from_secs(5), fut).await;
    assert!(res.is_ok(), "{:?}", res);
    let inner_res = res.unwrap();
    assert!(inner_res.is_ok(), "{:?}", inner_res);
}
