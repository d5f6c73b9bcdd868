use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ConnectionConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;

pub mod tcp;
pub mod unix;

pub use self::tcp::{TcpTransport, TcpTransportBuilder};
pub use self::unix::{UnixTransport, UnixTransportBuilder};

/// Byte stream a connection runs its codec over
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> StreamTrait for T {}

pub type BoxedStream = Box<dyn StreamTrait>;

/// Transport trait for opening streams to the broker
///
/// A transport is a reusable opener: the connection calls `open` once per
/// connect attempt and owns the returned stream until the link is lost.
#[async_trait::async_trait(?Send)]
pub trait Transport {
    /// Open a fresh stream to the broker
    async fn open(&self) -> Result<BoxedStream>;

    /// Human-readable peer description for logs
    fn describe(&self) -> String;
}

/// Build the transport matching an endpoint's scheme
pub fn for_endpoint(endpoint: &Endpoint, config: &ConnectionConfig) -> Box<dyn Transport> {
    match endpoint {
        Endpoint::Tcp { host, port } => Box::new(
            TcpTransport::builder()
                .host(host.clone(), *port)
                .connect_timeout(config.connect_timeout)
                .nodelay(config.nodelay)
                .build(),
        ),
        Endpoint::Unix { path } => Box::new(
            UnixTransport::builder()
                .path(path)
                .connect_timeout(config.connect_timeout)
                .build(),
        ),
    }
}
