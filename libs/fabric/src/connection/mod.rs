//! Broker connection with automatic reconnection
//!
//! A [`Connection`] is a cheap, reference-counted handle. The stream itself
//! is owned by a background task on the event loop (see `driver`), which
//! writes queued frames while connected, routes replies to their requests
//! and reconnects with backoff when the link drops. Session logins and
//! subscriptions are standing registrations, sent again on every connect.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                                 ^   |              |
//!                                 |   +--failure-----+--> Reconnecting
//!                                 +---- backoff timer ------+
//! any state --close()--> Closed
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use courier_core::{Serializer, StringSerializer};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};

use crate::backoff::Backoff;
use crate::channel::{validate_target, Channel};
use crate::codec::{CorrelationId, PostFrame, RequestFrame, SubscribeFrame, Upstream};
use crate::config::ConnectionConfig;
use crate::dispatcher::{Completion, Dispatcher, Entry, MessageSink, Subscribed};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::outbox::{Outbox, Queued, Ticket};
use crate::request::RequestState;
use crate::session::{SessionEntry, SessionState, SessionTable};
use crate::transport::{self, Transport};

mod driver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Counters kept for the lifetime of a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    /// Messages delivered to a request or subscription
    pub replies_dispatched: u64,
    /// Messages whose correlation id matched no live request or subscription
    pub unknown_replies: u64,
    /// Calls delivered to a session handler
    pub calls_dispatched: u64,
    /// Session frames for names this client is not logged in as
    pub unknown_sessions: u64,
    pub connects: u64,
    pub disconnects: u64,
}

/// Where a submitted request can be found again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Receipt {
    pub ticket: Ticket,
    pub correlation_id: Option<CorrelationId>,
}

/// Everything the connection needs to take over a request
pub(crate) struct Submission {
    pub target: String,
    pub payload: Bytes,
    pub timeout: Option<Duration>,
    pub completion: Option<Completion>,
    pub state: Rc<Cell<RequestState>>,
}

/// Mutable connection state, shared by handles and the driver task
pub(crate) struct Core {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub backoff: Backoff,
    pub backoff_deadline: Option<Instant>,
    pub outbox: Outbox,
    /// Session and subscription frames for the current link, written ahead
    /// of requests. Cleared when the link goes.
    pub control: VecDeque<Upstream>,
    pub dispatcher: Dispatcher,
    pub sessions: SessionTable,
    /// Bumped on every successful connect; postrefs are only valid on the
    /// link they arrived on
    pub link_epoch: u64,
    pub stats: ConnectionStats,
    next_ticket: Ticket,
}

impl Core {
    fn new(config: &ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            backoff: Backoff::new(config.backoff.clone()),
            backoff_deadline: None,
            outbox: Outbox::new(&config.queue),
            control: VecDeque::new(),
            dispatcher: Dispatcher::new(),
            sessions: SessionTable::default(),
            link_epoch: 0,
            stats: ConnectionStats::default(),
            next_ticket: 1,
        }
    }

    fn take_ticket(&mut self) -> Ticket {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Queue a control frame if there is a link to write it on
    fn send_control(&mut self, frame: Upstream) -> bool {
        if self.state == ConnectionState::Connected {
            self.control.push_back(frame);
            true
        } else {
            false
        }
    }
}

pub(crate) struct Shared {
    pub core: RefCell<Core>,
    /// Wakes the driver: new frames queued, request withdrawn, close
    pub wake: Notify,
    pub config: ConnectionConfig,
    pub transport: Box<dyn Transport>,
    endpoint: Endpoint,
    loop_handle: LoopHandle,
    handles: Cell<usize>,
}

impl Shared {
    pub fn is_closed(&self) -> bool {
        self.core.borrow().state == ConnectionState::Closed
    }

    /// Enter `Closed` and fail everything still pending. Handlers run after
    /// the state borrow is released.
    fn close(&self) {
        let (entries, queued, sessions, subscriptions) = {
            let mut core = self.core.borrow_mut();
            if core.state == ConnectionState::Closed {
                return;
            }
            info!(
                endpoint = %self.endpoint,
                from = %core.state,
                pending = core.dispatcher.len(),
                queued = core.outbox.len(),
                sessions = core.sessions.len(),
                subscriptions = core.dispatcher.subscription_count(),
                "closing connection"
            );
            core.state = ConnectionState::Closed;
            core.backoff_deadline = None;
            core.control.clear();
            (
                core.dispatcher.drain_all(),
                core.outbox.drain(),
                core.sessions.drain(),
                core.dispatcher.drain_subscriptions(),
            )
        };
        self.wake.notify_one();

        for item in queued {
            if item.frame.correlation_id.is_none() {
                item.state.set(RequestState::Failed);
            }
        }
        for entry in entries {
            entry.complete(Err(Error::ConnectionClosed));
        }
        for session in sessions {
            session.end();
        }
        for subscribed in subscriptions {
            (subscribed.sink)(Err(Error::ConnectionClosed));
        }
    }
}

/// The link a call or interest arrived on. Answers are only meaningful to
/// the broker on that same link.
#[derive(Clone)]
pub(crate) struct LinkRef {
    shared: Weak<Shared>,
    epoch: u64,
}

impl LinkRef {
    pub(crate) fn new(shared: &Rc<Shared>, epoch: u64) -> Self {
        Self {
            shared: Rc::downgrade(shared),
            epoch,
        }
    }

    /// Queue a POST for `postref`. Fails with `ConnectionClosed` once the
    /// link this reference belongs to is gone.
    pub(crate) fn post(&self, postref: u32, payload: Bytes) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(Error::ConnectionClosed)?;
        {
            let mut core = shared.core.borrow_mut();
            if core.link_epoch != self.epoch {
                return Err(Error::ConnectionClosed);
            }
            let frame = Upstream::Post(PostFrame { postref, payload });
            if !core.send_control(frame) {
                return Err(Error::ConnectionClosed);
            }
        }
        shared.wake.notify_one();
        Ok(())
    }
}

impl fmt::Debug for LinkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkRef").field("epoch", &self.epoch).finish()
    }
}

/// Handle to a broker connection
///
/// Clones share one connection. Dropping the last handle (including those
/// held by channels and requests) closes it.
pub struct Connection {
    shared: Rc<Shared>,
}

impl Connection {
    /// Create a connection to `endpoint`; nothing happens until `connect()`
    pub fn new(event_loop: &EventLoop, endpoint: Endpoint, config: ConnectionConfig) -> Result<Self> {
        let transport = transport::for_endpoint(&endpoint, &config);
        Self::with_transport(event_loop, endpoint, transport, config)
    }

    /// Create a connection that opens its streams through `transport`
    pub fn with_transport(
        event_loop: &EventLoop,
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Rc::new(Shared {
                core: RefCell::new(Core::new(&config)),
                wake: Notify::new(),
                config,
                transport,
                endpoint,
                loop_handle: event_loop.handle(),
                handles: Cell::new(1),
            }),
        })
    }

    /// Start connecting in the background
    ///
    /// A no-op once started; an error on a closed connection or when the
    /// event loop is gone.
    pub fn connect(&self) -> Result<()> {
        let mut core = self.shared.core.borrow_mut();
        match core.state {
            ConnectionState::Closed => Err(Error::invalid_state("connection is closed")),
            ConnectionState::Disconnected => {
                let span = info_span!(
                    "connection",
                    peer = %self.shared.transport.describe()
                );
                self.shared
                    .loop_handle
                    .spawn(driver::run(self.shared.clone()).instrument(span))?;
                core.state = ConnectionState::Connecting;
                debug!(endpoint = %self.shared.endpoint, "connection task started");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Close the connection for every handle. Pending requests fail with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Failed attempts since the last successful connect
    pub fn retry_count(&self) -> u32 {
        self.shared.core.borrow().retry_count
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.core.borrow().stats
    }

    /// Requests waiting for a reply, sent or not
    pub fn pending(&self) -> usize {
        self.shared.core.borrow().dispatcher.len()
    }

    /// Frames waiting to be written
    pub fn queued(&self) -> usize {
        self.shared.core.borrow().outbox.len()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Channel to `target` using UTF-8 string payloads
    pub fn channel(&self, target: impl Into<String>) -> Result<Channel<StringSerializer>> {
        self.channel_with(target, StringSerializer)
    }

    /// Channel to `target` using a custom serializer
    pub fn channel_with<S>(&self, target: impl Into<String>, serializer: S) -> Result<Channel<S>>
    where
        S: Serializer + 'static,
        S::Value: 'static,
    {
        let target = target.into();
        validate_target(&target)?;
        Ok(Channel::new(self.clone(), target, serializer))
    }

    /// Register a request and queue its frame
    pub(crate) fn submit(&self, submission: Submission) -> Result<Receipt> {
        let Submission {
            target,
            payload,
            timeout,
            completion,
            state,
        } = submission;

        let mut rejected: Option<Entry> = None;
        let mut evicted: Option<Queued> = None;
        let mut evicted_entry: Option<Entry> = None;

        let outcome = {
            let mut core = self.shared.core.borrow_mut();
            if core.state == ConnectionState::Closed {
                return Err(Error::ConnectionClosed);
            }

            let ticket = core.take_ticket();

            let correlation_id = match completion {
                Some(_) => Some(core.dispatcher.allocate()?),
                None => None,
            };
            let frame = RequestFrame {
                target,
                correlation_id,
                timeout_ms: timeout.map_or(0, |t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX)),
                payload,
            };
            if let (Some(id), Some(completion)) = (correlation_id, completion) {
                // Too far out to represent means no deadline
                let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
                core.dispatcher.insert(
                    id,
                    Entry::new(ticket, frame.clone(), state.clone(), completion, timeout, deadline),
                );
            }

            let queued = Queued {
                ticket,
                frame,
                state,
            };
            match core.outbox.push(queued) {
                Ok(dropped) => {
                    if let Some(item) = dropped {
                        if let Some(id) = item.frame.correlation_id {
                            evicted_entry = core.dispatcher.cancel(id, item.ticket);
                        }
                        evicted = Some(item);
                    }
                    debug!(
                        ticket,
                        correlation_id = correlation_id.map(CorrelationId::get),
                        queued = core.outbox.len(),
                        "request queued"
                    );
                    Ok(Receipt {
                        ticket,
                        correlation_id,
                    })
                }
                Err(e) => {
                    if let Some(id) = correlation_id {
                        rejected = core.dispatcher.cancel(id, ticket);
                    }
                    Err(e)
                }
            }
        };
        drop(rejected);

        if let Some(item) = evicted {
            debug!(ticket = item.ticket, "queue full, dropped oldest request");
            let error = Error::QueueFull {
                capacity: self.shared.config.queue.capacity,
            };
            match evicted_entry {
                Some(entry) => entry.complete(Err(error)),
                None => item.state.set(RequestState::Failed),
            }
        }

        if outcome.is_ok() {
            self.shared.wake.notify_one();
        }
        outcome
    }

    /// Register a session login; the LOGIN frame goes out now if connected
    /// and again after every reconnect.
    pub(crate) fn login(&self, mut entry: SessionEntry) -> Result<Ticket> {
        let key = {
            let mut core = self.shared.core.borrow_mut();
            if core.state == ConnectionState::Closed {
                return Err(Error::ConnectionClosed);
            }
            entry.key = core.take_ticket();
            let key = entry.key;
            let frame = entry.login_frame();
            core.sessions.insert(entry)?;
            core.send_control(Upstream::Login(frame));
            debug!(session = key, sessions = core.sessions.len(), "session registered");
            key
        };
        self.shared.wake.notify_one();
        Ok(key)
    }

    pub(crate) fn logout(&self, name: &str, key: Ticket) {
        let removed = {
            let mut core = self.shared.core.borrow_mut();
            let removed = core.sessions.remove(name, key);
            if removed.is_some() {
                core.send_control(Upstream::Logout {
                    name: name.to_string(),
                });
            }
            removed
        };
        if let Some(entry) = removed {
            entry.state.set(SessionState::Idle);
            debug!(session = key, "session logged out");
            self.shared.wake.notify_one();
        }
    }

    /// Register a subscription; the SUBSCRIBE frame goes out now if
    /// connected and again after every reconnect.
    pub(crate) fn subscribe(
        &self,
        name: String,
        topic: Bytes,
        sink: MessageSink,
    ) -> Result<(CorrelationId, Ticket)> {
        let receipt = {
            let mut core = self.shared.core.borrow_mut();
            if core.state == ConnectionState::Closed {
                return Err(Error::ConnectionClosed);
            }
            let key = core.take_ticket();
            let correlation_id = core.dispatcher.allocate()?;
            let frame = SubscribeFrame {
                correlation_id,
                name,
                topic,
            };
            core.send_control(Upstream::Subscribe(frame.clone()));
            core.dispatcher.subscribe(Subscribed { key, frame, sink });
            debug!(
                correlation_id = correlation_id.get(),
                subscriptions = core.dispatcher.subscription_count(),
                "subscription registered"
            );
            (correlation_id, key)
        };
        self.shared.wake.notify_one();
        Ok(receipt)
    }

    pub(crate) fn unsubscribe(&self, correlation_id: CorrelationId, key: Ticket) {
        let removed = {
            let mut core = self.shared.core.borrow_mut();
            let removed = core.dispatcher.unsubscribe(correlation_id, key);
            if let Some(subscribed) = &removed {
                core.send_control(Upstream::Unsubscribe {
                    name: subscribed.frame.name.clone(),
                    topic: subscribed.frame.topic.clone(),
                });
            }
            removed
        };
        if removed.is_some() {
            debug!(correlation_id = correlation_id.get(), "subscription dropped");
            self.shared.wake.notify_one();
        }
    }

    /// Sessions currently registered
    pub fn sessions(&self) -> usize {
        self.shared.core.borrow().sessions.len()
    }

    pub fn subscriptions(&self) -> usize {
        self.shared.core.borrow().dispatcher.subscription_count()
    }

    #[cfg(test)]
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.shared.core.borrow().dispatcher.next_deadline()
    }

    /// Take a request back out of the queue and the pending table
    pub(crate) fn withdraw(&self, receipt: Receipt) {
        let removed = {
            let mut core = self.shared.core.borrow_mut();
            let queued = core.outbox.remove(receipt.ticket);
            let entry = receipt
                .correlation_id
                .and_then(|id| core.dispatcher.cancel(id, receipt.ticket));
            (queued, entry)
        };
        if removed.0.is_some() || removed.1.is_some() {
            debug!(ticket = receipt.ticket, "request withdrawn");
            self.shared.wake.notify_one();
        }
    }
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        self.shared.handles.set(self.shared.handles.get() + 1);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let remaining = self.shared.handles.get().saturating_sub(1);
        self.shared.handles.set(remaining);
        if remaining == 0 {
            debug!(endpoint = %self.shared.endpoint, "last handle released");
            self.shared.close();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
