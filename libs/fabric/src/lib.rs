//! Courier Fabric - client session engine for a request/response broker
//!
//! One [`Connection`] multiplexes any number of outstanding requests over a
//! single stream to the broker, reconnects with backoff when the link drops
//! and routes every reply to the handler of the request it answers.
//! The same connection can also log in as a named [`Session`] to serve
//! calls, and [`subscribe`](Channel::subscribe) to topics other sessions
//! publish. Everything runs on a single-threaded [`EventLoop`].
//!
//! # Example
//!
//! ```no_run
//! use courier_fabric::create_session;
//!
//! # fn example() -> courier_fabric::Result<()> {
//! let (event_loop, connection) = create_session("nxtcp://127.0.0.1:4747")?;
//! let channel = connection.channel("demo_target")?;
//!
//! let stop = event_loop.handle();
//! let mut request = channel.call("demo_payload".to_string());
//! request.set_handler(move |reply| {
//!     match reply {
//!         Ok(text) => println!("got {}", text),
//!         Err(e) => eprintln!("failed: {}", e),
//!     }
//!     stop.stop();
//! })?;
//! request.send()?;
//!
//! event_loop.run_forever();
//! # Ok(())
//! # }
//! ```
//!
//! Or await the reply instead of installing a handler:
//!
//! ```no_run
//! # fn example() -> courier_fabric::Result<()> {
//! let (event_loop, connection) = courier_fabric::create_session("nxtcp://127.0.0.1:4747")?;
//! let channel = connection.channel("demo_target")?;
//! let reply = event_loop.run_until(channel.call("demo_payload".to_string()).response())?;
//! assert_eq!(reply, "pong");
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod event_loop;
pub mod logging;
mod outbox;
pub mod request;
pub mod session;
pub mod subscription;
pub mod transport;

use std::str::FromStr;

// Re-exports for convenience
pub use channel::Channel;
pub use codec::LoginOptions;
pub use config::{BackoffConfig, ConnectionConfig, DisconnectPolicy, OverflowPolicy, QueueConfig};
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use courier_core::{
    BincodeSerializer, JsonSerializer, RawSerializer, Serializer, StringSerializer,
};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use request::{Request, RequestState, Response};
pub use session::{Call, Interest, Session, SessionState};
pub use subscription::Subscription;

/// Create an event loop and a connection to `uri` that is already connecting
pub fn create_session(uri: &str) -> Result<(EventLoop, Connection)> {
    let event_loop = EventLoop::new()?;
    let connection = create_connection(&event_loop, uri)?;
    Ok((event_loop, connection))
}

/// Create a connection to `uri` on an existing loop and start connecting
pub fn create_connection(event_loop: &EventLoop, uri: &str) -> Result<Connection> {
    create_connection_with(event_loop, uri, ConnectionConfig::default())
}

/// Like [`create_connection`], with explicit configuration
pub fn create_connection_with(
    event_loop: &EventLoop,
    uri: &str,
    config: ConnectionConfig,
) -> Result<Connection> {
    let endpoint = Endpoint::from_str(uri)?;
    let connection = Connection::new(event_loop, endpoint, config)?;
    connection.connect()?;
    Ok(connection)
}
