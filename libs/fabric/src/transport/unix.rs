use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{BoxedStream, Transport};

/// Unix domain socket transport for a broker on the local machine
#[derive(Debug, Clone)]
pub struct UnixTransport {
    path: PathBuf,
    connect_timeout: Option<Duration>,
}

impl UnixTransport {
    /// Transport to the socket at `path` with no connect timeout
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::builder().path(path).build()
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> UnixTransportBuilder {
        UnixTransportBuilder::new()
    }

    /// Connect and return the concrete stream
    pub async fn connect(&self) -> Result<UnixStream> {
        let connect_op = UnixStream::connect(&self.path);

        let stream = if let Some(timeout) = self.connect_timeout {
            tokio::time::timeout(timeout, connect_op)
                .await
                .map_err(|_| {
                    Error::transport(format!(
                        "connect to {} timed out after {:?}",
                        self.path.display(),
                        timeout
                    ))
                })??
        } else {
            connect_op.await?
        };

        debug!(path = %self.path.display(), "unix stream open");
        Ok(stream)
    }
}

#[async_trait::async_trait(?Send)]
impl Transport for UnixTransport {
    async fn open(&self) -> Result<BoxedStream> {
        Ok(Box::new(self.connect().await?))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Builder for configuring Unix socket transport
#[derive(Debug, Default)]
pub struct UnixTransportBuilder {
    path: Option<PathBuf>,
    connect_timeout: Option<Duration>,
}

impl UnixTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the socket path to connect to
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> UnixTransport {
        UnixTransport {
            path: self.path.unwrap_or_default(),
            connect_timeout: self.connect_timeout,
        }
    }
}
