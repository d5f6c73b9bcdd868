use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use courier_core::{Serializer, StringSerializer};
use tracing::debug;

use crate::codec::MAX_PAYLOAD_SIZE;
use crate::connection::{Connection, Receipt};
use crate::dispatcher::MessageSink;
use crate::error::{Error, Result};
use crate::request::{self, Request, RequestState};
use crate::session::Session;
use crate::subscription::Subscription;

/// Longest target name the wire format can carry
pub const MAX_TARGET_LEN: usize = 255;

/// Check a target name: 1 to 255 bytes of `[0-9A-Za-z_-]`
pub fn validate_target(target: &str) -> Result<()> {
    let well_formed = !target.is_empty()
        && target.len() <= MAX_TARGET_LEN
        && target
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if well_formed {
        Ok(())
    } else {
        Err(Error::InvalidTarget(target.to_string()))
    }
}

/// Requests sent through a channel and its clones
#[derive(Debug, Default)]
pub(crate) struct Issued {
    requests: RefCell<Vec<(Receipt, Rc<Cell<RequestState>>)>>,
}

impl Issued {
    pub fn record(&self, receipt: Receipt, state: Rc<Cell<RequestState>>) {
        let mut requests = self.requests.borrow_mut();
        requests.retain(|(_, state)| state.get().is_live());
        requests.push((receipt, state));
    }

    /// Cancel every request still waiting to be written or answered
    fn withdraw_all(&self, connection: &Connection) -> usize {
        let requests = std::mem::take(&mut *self.requests.borrow_mut());
        requests
            .into_iter()
            .filter(|(receipt, state)| {
                state.get().is_live() && request::withdraw(connection, Some(*receipt), state).is_ok()
            })
            .count()
    }
}

/// Named endpoint on a shared connection
///
/// Many channels can share one [`Connection`]; the connection closes once
/// the last channel, request and handle referring to it is gone.
pub struct Channel<S: Serializer = StringSerializer> {
    target: String,
    connection: Connection,
    serializer: Rc<S>,
    issued: Rc<Issued>,
}

impl<S> Channel<S>
where
    S: Serializer + 'static,
    S::Value: 'static,
{
    pub(crate) fn new(connection: Connection, target: String, serializer: S) -> Self {
        Self {
            target,
            connection,
            serializer: Rc::new(serializer),
            issued: Rc::new(Issued::default()),
        }
    }

    /// Build a request to `target`, encoded with this channel's serializer
    pub fn request(&self, target: impl Into<String>, payload: S::Value) -> Request<S> {
        Request::new(
            self.connection.clone(),
            self.serializer.clone(),
            self.issued.clone(),
            target.into(),
            payload,
        )
    }

    /// Build a request to this channel's own target
    pub fn call(&self, payload: S::Value) -> Request<S> {
        self.request(self.target.clone(), payload)
    }

    /// Prepare a login as session `name`, with calls decoded by this
    /// channel's serializer. Nothing is sent until [`Session::login`].
    pub fn session(&self, name: impl Into<String>) -> Result<Session<S>> {
        let name = name.into();
        validate_target(&name)?;
        Ok(Session::new(
            self.connection.clone(),
            self.serializer.clone(),
            name,
        ))
    }

    /// Receive every message session `name` publishes on `topic`.
    /// `handler` runs once per message and once more with the error that
    /// ends the subscription, if the connection closes first.
    pub fn subscribe<F>(
        &self,
        name: impl Into<String>,
        topic: impl Into<Bytes>,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Result<S::Value>) + 'static,
    {
        let name = name.into();
        validate_target(&name)?;
        let topic = topic.into();
        if topic.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: topic.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let serializer = self.serializer.clone();
        let sink: MessageSink = Rc::new(move |message: Result<Bytes>| {
            handler(message.and_then(|bytes| serializer.decode(&bytes).map_err(Error::from)))
        });
        let receipt = self.connection.subscribe(name.clone(), topic.clone(), sink)?;
        debug!(service = %name, "subscribed");
        Ok(Subscription::new(self.connection.clone(), name, topic, receipt))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Cancel every live request sent through this channel (or a clone of
    /// it) and release this channel's hold on the connection. Handlers of
    /// the cancelled requests never run; late replies are discarded.
    pub fn close(self) {
        let withdrawn = self.issued.withdraw_all(&self.connection);
        debug!(service = %self.target, withdrawn, "channel closed");
    }
}

impl<S: Serializer> Clone for Channel<S> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            connection: self.connection.clone(),
            serializer: self.serializer.clone(),
            issued: self.issued.clone(),
        }
    }
}

impl<S: Serializer> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target)
            .field("connection", &self.connection)
            .finish()
    }
}
