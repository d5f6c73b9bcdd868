use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{BoxedStream, Transport};

/// TCP transport
///
/// Resolves and connects on every `open`, so a broker that moved to a new
/// address is picked up on reconnect.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpTransport {
    /// Transport to `host:port` with no connect timeout
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::builder().host(host, port).build()
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    /// Connect and return the concrete stream
    pub async fn connect(&self) -> Result<TcpStream> {
        let connect_op = TcpStream::connect((self.host.as_str(), self.port));

        let stream = if let Some(timeout) = self.connect_timeout {
            tokio::time::timeout(timeout, connect_op)
                .await
                .map_err(|_| {
                    Error::transport(format!(
                        "connect to {} timed out after {:?}",
                        self.describe(),
                        timeout
                    ))
                })??
        } else {
            connect_op.await?
        };

        stream.set_nodelay(self.nodelay)?;
        debug!(peer = %self.describe(), local = ?stream.local_addr().ok(), "tcp stream open");
        Ok(stream)
    }
}

#[async_trait::async_trait(?Send)]
impl Transport for TcpTransport {
    async fn open(&self) -> Result<BoxedStream> {
        Ok(Box::new(self.connect().await?))
    }

    fn describe(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Builder for configuring TCP transport
#[derive(Debug)]
pub struct TcpTransportBuilder {
    host: String,
    port: u16,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl Default for TcpTransportBuilder {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            connect_timeout: None,
            nodelay: true,
        }
    }
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host and port to connect to
    pub fn host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set `TCP_NODELAY` on opened streams
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn build(self) -> TcpTransport {
        TcpTransport {
            host: self.host,
            port: self.port,
            connect_timeout: self.connect_timeout,
            nodelay: self.nodelay,
        }
    }
}
