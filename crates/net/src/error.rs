use std::net::SocketAddr;

/// Problems with how a server or client was set up.
///
/// These happen at startup and the embedding process is expected to give up on them rather than run half
/// initialized.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("no address was given")]
    EmptyAddress,

    #[error("could not bind {address}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not connect to {address}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    #[error("the server is already serving or was closed")]
    AlreadyServing,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("connection {id} to {peer} is closed")]
    Closed { id: u64, peer: SocketAddr },

    #[error("connection {id} to {peer} has {unsent} unsent bytes, more than the {max} allowed")]
    Backlogged {
        id: u64,
        peer: SocketAddr,
        unsent: usize,
        max: usize,
    },
}
