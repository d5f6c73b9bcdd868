//! Serving calls under a session name
//!
//! A client that logs in as a session receives the requests other clients
//! address to that name as [`Call`]s, and answers them by posting a reply.
//! Clients that subscribe to one of the session's topics show up as an
//! [`Interest`]; the session publishes to them by posting on it.
//!
//! Logins are standing registrations: they are sent again after every
//! reconnect until the session logs out or is dropped.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use courier_core::{Serializer, StringSerializer};
use tracing::trace;

use crate::codec::{
    CallFrame, InterestFrame, LoginFrame, LoginOptions, SessionStatus, MAX_PAYLOAD_SIZE,
};
use crate::connection::{Connection, LinkRef};
use crate::error::{Error, Result};
use crate::outbox::Ticket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not logged in
    Idle,
    /// Login registered, no answer from the broker on the current link yet
    LoggingIn,
    Active,
    /// Another client holds the name; this one takes over when it leaves
    Standby,
    /// The broker ended the session, or the connection was closed
    Ended,
}

impl From<SessionStatus> for SessionState {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Ended => Self::Ended,
            SessionStatus::Standby => Self::Standby,
            SessionStatus::Active => Self::Active,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LoggingIn => "logging in",
            Self::Active => "active",
            Self::Standby => "standby",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

pub(crate) type CallSink = Rc<dyn Fn(CallFrame, LinkRef)>;
pub(crate) type InterestSink = Rc<dyn Fn(InterestFrame, LinkRef)>;
pub(crate) type StateSink = Rc<dyn Fn(SessionState)>;

/// A session as the connection keeps it
pub(crate) struct SessionEntry {
    pub key: Ticket,
    pub name: String,
    pub options: LoginOptions,
    pub on_call: Option<CallSink>,
    pub on_interest: Option<InterestSink>,
    pub on_state: Option<StateSink>,
    pub state: Rc<Cell<SessionState>>,
}

impl SessionEntry {
    pub fn login_frame(&self) -> LoginFrame {
        LoginFrame {
            name: self.name.clone(),
            options: self.options,
        }
    }

    /// Mark the session ended and tell its handler. Call without the
    /// connection state borrowed.
    pub fn end(self) {
        self.state.set(SessionState::Ended);
        if let Some(sink) = self.on_state {
            sink(SessionState::Ended);
        }
    }

    fn transition(&self, state: SessionState) -> Transition {
        self.state.set(state);
        Transition {
            sink: self.on_state.clone(),
            state,
        }
    }
}

/// A state change waiting to be reported to a session handler
pub(crate) struct Transition {
    sink: Option<StateSink>,
    state: SessionState,
}

impl Transition {
    pub fn notify(self) {
        if let Some(sink) = self.sink {
            sink(self.state);
        }
    }
}

/// Sessions logged in on one connection, by name
#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: HashMap<String, SessionEntry>,
}

impl SessionTable {
    pub fn insert(&mut self, entry: SessionEntry) -> Result<()> {
        if self.sessions.contains_key(&entry.name) {
            return Err(Error::invalid_state(format!(
                "already logged in as {:?} on this connection",
                entry.name
            )));
        }
        self.sessions.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Remove a session, provided `name` still belongs to `key`
    pub fn remove(&mut self, name: &str, key: Ticket) -> Option<SessionEntry> {
        match self.sessions.get(name) {
            Some(entry) if entry.key == key => self.sessions.remove(name),
            _ => None,
        }
    }

    /// LOGIN frames for every session, oldest first
    pub fn login_frames(&self) -> Vec<LoginFrame> {
        let mut entries: Vec<&SessionEntry> = self.sessions.values().collect();
        entries.sort_by_key(|entry| entry.key);
        entries.into_iter().map(SessionEntry::login_frame).collect()
    }

    pub fn call_sink(&self, name: &str) -> Option<Option<CallSink>> {
        self.sessions.get(name).map(|entry| entry.on_call.clone())
    }

    pub fn interest_sink(&self, name: &str) -> Option<Option<InterestSink>> {
        self.sessions.get(name).map(|entry| entry.on_interest.clone())
    }

    /// Record a state reported by the broker. `None` for unknown names.
    pub fn update(&mut self, name: &str, status: SessionStatus) -> Option<Transition> {
        self.sessions
            .get(name)
            .map(|entry| entry.transition(status.into()))
    }

    /// Put every session back to waiting for its login, as after a lost link
    pub fn relogin(&mut self) -> Vec<Transition> {
        self.sessions
            .values()
            .filter(|entry| entry.state.get() != SessionState::LoggingIn)
            .map(|entry| entry.transition(SessionState::LoggingIn))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self.sessions.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|entry| entry.key);
        entries
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

fn encode_payload<S: Serializer>(serializer: &S, value: &S::Value) -> Result<Bytes> {
    let bytes = serializer.encode(value)?;
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(Bytes::from(bytes))
}

/// A request addressed to one of this client's sessions
pub struct Call<S: Serializer = StringSerializer> {
    frame: CallFrame,
    payload: std::result::Result<S::Value, courier_core::Error>,
    serializer: Rc<S>,
    link: LinkRef,
}

impl<S: Serializer> Call<S> {
    fn new(frame: CallFrame, serializer: Rc<S>, link: LinkRef) -> Self {
        let payload = serializer.decode(&frame.payload);
        Self {
            frame,
            payload,
            serializer,
            link,
        }
    }

    /// Session name the call was addressed to
    pub fn name(&self) -> &str {
        &self.frame.name
    }

    /// Whether the caller waits for a reply
    pub fn expects_reply(&self) -> bool {
        !self.frame.unidirectional
    }

    pub fn payload(&self) -> Result<&S::Value> {
        self.payload
            .as_ref()
            .map_err(|e| Error::Serialization(e.clone()))
    }

    pub fn into_payload(self) -> Result<S::Value> {
        self.payload.map_err(Error::from)
    }

    /// Answer the call. Fails with `ConnectionClosed` if the link the call
    /// came in on is gone; the caller then sees its own timeout.
    pub fn post(self, reply: &S::Value) -> Result<()> {
        if self.frame.unidirectional {
            return Err(Error::invalid_state("call does not expect a reply"));
        }
        let payload = encode_payload(&*self.serializer, reply)?;
        trace!(postref = self.frame.postref, bytes = payload.len(), "posting reply");
        self.link.post(self.frame.postref, payload)
    }
}

impl<S: Serializer> fmt::Debug for Call<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("name", &self.frame.name)
            .field("postref", &self.frame.postref)
            .field("unidirectional", &self.frame.unidirectional)
            .finish()
    }
}

/// Subscribers for a topic of one of this client's sessions
///
/// Keep it to publish to them for as long as the interest lasts.
pub struct Interest<S: Serializer = StringSerializer> {
    frame: InterestFrame,
    serializer: Rc<S>,
    link: LinkRef,
}

impl<S: Serializer> Interest<S> {
    pub fn name(&self) -> &str {
        &self.frame.name
    }

    pub fn topic(&self) -> &[u8] {
        &self.frame.topic
    }

    /// `false` once the last subscriber for the topic is gone
    pub fn is_interested(&self) -> bool {
        self.frame.interested
    }

    /// Publish a message to the topic's subscribers
    pub fn post(&self, message: &S::Value) -> Result<()> {
        if !self.frame.interested {
            return Err(Error::invalid_state("nobody is subscribed to this topic"));
        }
        let payload = encode_payload(&*self.serializer, message)?;
        self.link.post(self.frame.postref, payload)
    }
}

impl<S: Serializer> Clone for Interest<S> {
    fn clone(&self) -> Self {
        Self {
            frame: self.frame.clone(),
            serializer: self.serializer.clone(),
            link: self.link.clone(),
        }
    }
}

impl<S: Serializer> fmt::Debug for Interest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interest")
            .field("name", &self.frame.name)
            .field("postref", &self.frame.postref)
            .field("interested", &self.frame.interested)
            .finish()
    }
}

/// Login as a named session
///
/// Configure options and handlers, then [`Session::login`]. Dropping the
/// session logs it out.
pub struct Session<S: Serializer = StringSerializer> {
    connection: Connection,
    serializer: Rc<S>,
    name: String,
    options: LoginOptions,
    on_call: Option<Rc<dyn Fn(Call<S>)>>,
    on_interest: Option<Rc<dyn Fn(Interest<S>)>>,
    on_state: Option<StateSink>,
    state: Rc<Cell<SessionState>>,
    key: Option<Ticket>,
}

impl<S> Session<S>
where
    S: Serializer + 'static,
    S::Value: 'static,
{
    pub(crate) fn new(connection: Connection, serializer: Rc<S>, name: String) -> Self {
        Self {
            connection,
            serializer,
            name,
            options: LoginOptions::default(),
            on_call: None,
            on_interest: None,
            on_state: None,
            state: Rc::new(Cell::new(SessionState::Idle)),
            key: None,
        }
    }

    /// Ask the broker to keep the name while this client is away
    pub fn persist(&mut self, persist: bool) -> Result<&mut Self> {
        self.ensure_logged_out("change options of")?;
        self.options.persist = persist;
        Ok(self)
    }

    /// Queue behind the current holder of the name instead of failing
    pub fn standby(&mut self, standby: bool) -> Result<&mut Self> {
        self.ensure_logged_out("change options of")?;
        self.options.standby = standby;
        Ok(self)
    }

    /// Take the name over from its current holder
    pub fn enforce(&mut self, enforce: bool) -> Result<&mut Self> {
        self.ensure_logged_out("change options of")?;
        self.options.enforce = enforce;
        Ok(self)
    }

    pub fn on_call<F>(&mut self, handler: F) -> Result<&mut Self>
    where
        F: Fn(Call<S>) + 'static,
    {
        self.ensure_logged_out("set a handler on")?;
        self.on_call = Some(Rc::new(handler));
        Ok(self)
    }

    pub fn on_interest<F>(&mut self, handler: F) -> Result<&mut Self>
    where
        F: Fn(Interest<S>) + 'static,
    {
        self.ensure_logged_out("set a handler on")?;
        self.on_interest = Some(Rc::new(handler));
        Ok(self)
    }

    /// Called with every state the broker reports, and on link loss
    pub fn on_state<F>(&mut self, handler: F) -> Result<&mut Self>
    where
        F: Fn(SessionState) + 'static,
    {
        self.ensure_logged_out("set a handler on")?;
        self.on_state = Some(Rc::new(handler));
        Ok(self)
    }

    /// Register the login with the connection
    pub fn login(&mut self) -> Result<()> {
        self.ensure_logged_out("log in")?;

        let on_call = self.on_call.clone().map(|handler| {
            let serializer = self.serializer.clone();
            Rc::new(move |frame: CallFrame, link: LinkRef| {
                handler(Call::new(frame, serializer.clone(), link))
            }) as CallSink
        });
        let on_interest = self.on_interest.clone().map(|handler| {
            let serializer = self.serializer.clone();
            Rc::new(move |frame: InterestFrame, link: LinkRef| {
                handler(Interest {
                    frame,
                    serializer: serializer.clone(),
                    link,
                })
            }) as InterestSink
        });

        self.state.set(SessionState::LoggingIn);
        let entry = SessionEntry {
            key: 0,
            name: self.name.clone(),
            options: self.options,
            on_call,
            on_interest,
            on_state: self.on_state.clone(),
            state: self.state.clone(),
        };
        match self.connection.login(entry) {
            Ok(key) => {
                self.key = Some(key);
                Ok(())
            }
            Err(e) => {
                self.state.set(SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Give the name back. Calls stop arriving; the session can log in again.
    pub fn logout(&mut self) -> Result<()> {
        let key = self
            .key
            .take()
            .ok_or_else(|| Error::invalid_state("session is not logged in"))?;
        self.connection.logout(&self.name, key);
        self.state.set(SessionState::Idle);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> LoginOptions {
        self.options
    }

    pub fn is_logged_in(&self) -> bool {
        self.key.is_some()
    }

    fn ensure_logged_out(&self, action: &str) -> Result<()> {
        if self.key.is_some() {
            return Err(Error::invalid_state(format!(
                "cannot {} a logged-in session",
                action
            )));
        }
        Ok(())
    }
}

impl<S: Serializer> Drop for Session<S> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.connection.logout(&self.name, key);
        }
    }
}

impl<S: Serializer> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("state", &self.state.get())
            .finish()
    }
}
