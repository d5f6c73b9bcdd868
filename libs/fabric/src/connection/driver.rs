//! The connection task
//!
//! One task per connection owns the stream. It loops over the connection
//! state: open a stream and wait for WELCOME, serve it until the link
//! drops, then sleep out the backoff and try again. Request deadlines are
//! swept whenever the task is idle, so timeouts fire in every state.

use std::cell::Cell;
use std::future::poll_fn;
use std::rc::Rc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use super::{ConnectionState, Core, LinkRef, Shared};
use crate::codec::{
    CallFrame, ClientCodec, Downstream, InterestFrame, ReplyFrame, SessionStatus, Upstream,
    PROTOCOL_VERSION,
};
use crate::config::DisconnectPolicy;
use crate::dispatcher::Resolution;
use crate::error::{Error, Result};
use crate::request::RequestState;
use crate::transport::BoxedStream;

type Link = Framed<BoxedStream, ClientCodec>;
type LinkSink = SplitSink<Link, Upstream>;

/// How long a closing connection waits to get QUIT out
const GOODBYE_GRACE: Duration = Duration::from_millis(250);

pub(super) async fn run(shared: Rc<Shared>) {
    let driver = Driver {
        shared,
        pongs: Cell::new(0),
        unflushed: Cell::new(false),
    };
    driver.run().await;
}

struct Driver {
    shared: Rc<Shared>,
    /// PONGs owed to the broker, written ahead of queued requests
    pongs: Cell<usize>,
    /// Frames handed to the sink but not yet flushed
    unflushed: Cell<bool>,
}

impl Driver {
    async fn run(&self) {
        loop {
            let state = self.shared.core.borrow().state;
            match state {
                ConnectionState::Closed => break,
                ConnectionState::Reconnecting => self.wait_for_retry().await,
                ConnectionState::Disconnected
                | ConnectionState::Connecting
                | ConnectionState::Connected => match self.attempt().await {
                    Some(Ok(link)) => {
                        self.on_connected();
                        if let Err(e) = self.serve(link).await {
                            self.on_link_lost(e);
                        }
                    }
                    Some(Err(e)) => self.on_attempt_failed(e),
                    None => {}
                },
            }
        }
        debug!("connection task finished");
    }

    /// One connect attempt, abandoned if the connection is closed meanwhile
    async fn attempt(&self) -> Option<Result<Link>> {
        self.set_state(ConnectionState::Connecting);
        let attempt = self.establish();
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return Some(result),
                _ = self.idle() => {
                    if self.shared.is_closed() {
                        return None;
                    }
                }
            }
        }
    }

    async fn establish(&self) -> Result<Link> {
        let stream = self.shared.transport.open().await?;
        let codec = ClientCodec::with_max_frame_size(self.shared.config.max_frame_size);
        let mut link = Framed::new(stream, codec);

        if let Some(limit) = self.shared.config.handshake_timeout {
            tokio::time::timeout(limit, self.handshake(&mut link))
                .await
                .map_err(|_| Error::transport(format!("no WELCOME within {:?}", limit)))??;
        }
        Ok(link)
    }

    async fn handshake(&self, link: &mut Link) -> Result<()> {
        loop {
            let frame = link.next().await.ok_or(Error::ConnectionClosed)??;
            self.count_received();

            match frame {
                Downstream::Welcome {
                    server_version,
                    protocol_version,
                } => {
                    if protocol_version != PROTOCOL_VERSION {
                        error!(
                            server_version,
                            protocol_version,
                            expected = PROTOCOL_VERSION,
                            "broker speaks a different protocol version"
                        );
                    } else {
                        debug!(server_version, "broker welcomed us");
                    }
                    return Ok(());
                }
                Downstream::Ping => {
                    link.send(Upstream::Pong).await?;
                    self.count_sent();
                }
                Downstream::ByeBye => {
                    return Err(Error::transport("broker said BYEBYE during handshake"));
                }
                Downstream::Reply(reply) => {
                    warn!(
                        correlation_id = reply.correlation_id,
                        "reply before WELCOME, discarding"
                    );
                    self.shared.core.borrow_mut().stats.unknown_replies += 1;
                }
                Downstream::Session { name, .. } => {
                    debug!(session = %name, "session update before WELCOME, skipping");
                }
                Downstream::Call(call) => {
                    debug!(session = %call.name, "call before WELCOME, skipping");
                }
                Downstream::Interest(interest) => {
                    debug!(session = %interest.name, "interest before WELCOME, skipping");
                }
            }
        }
    }

    /// Serve a connected link. Returns `Ok` when the connection was closed
    /// locally, or the error that cost us the link.
    async fn serve(&self, link: Link) -> Result<()> {
        let (mut sink, mut stream) = link.split();

        loop {
            if self.shared.is_closed() {
                self.say_goodbye(&mut sink).await;
                return Ok(());
            }

            let outbound = self.has_outbound();
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => self.handle_downstream(frame)?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::ConnectionClosed),
                },
                written = self.write_outbound(&mut sink), if outbound => written?,
                _ = self.idle() => {}
            }
        }
    }

    /// Write queued frames and flush. Safe to drop at any await point: a
    /// frame only leaves the queue once the sink has room for it, and an
    /// interrupted flush is resumed on the next call.
    async fn write_outbound(&self, sink: &mut LinkSink) -> Result<()> {
        loop {
            poll_fn(|cx| sink.poll_ready_unpin(cx)).await?;
            let Some(frame) = self.next_outbound() else {
                break;
            };
            sink.start_send_unpin(frame)?;
            self.unflushed.set(true);
        }

        poll_fn(|cx| sink.poll_flush_unpin(cx)).await?;
        self.unflushed.set(false);
        Ok(())
    }

    fn has_outbound(&self) -> bool {
        if self.pongs.get() > 0 || self.unflushed.get() {
            return true;
        }
        let core = self.shared.core.borrow();
        !core.control.is_empty() || !core.outbox.is_empty()
    }

    /// Next frame to write, with its request marked as written
    fn next_outbound(&self) -> Option<Upstream> {
        let mut core = self.shared.core.borrow_mut();

        if self.pongs.get() > 0 {
            self.pongs.set(self.pongs.get() - 1);
            core.stats.frames_sent += 1;
            return Some(Upstream::Pong);
        }

        if let Some(frame) = core.control.pop_front() {
            core.stats.frames_sent += 1;
            trace!(frame = frame.kind(), "writing control frame");
            return Some(frame);
        }

        let queued = core.outbox.pop_front()?;
        core.stats.frames_sent += 1;
        match queued.frame.correlation_id {
            Some(id) => core.dispatcher.mark_sent(id),
            None => queued.state.set(RequestState::Completed),
        }
        trace!(
            ticket = queued.ticket,
            service = %queued.frame.target,
            bytes = queued.frame.payload.len(),
            "writing request"
        );
        Some(Upstream::Request(queued.frame))
    }

    fn handle_downstream(&self, frame: Downstream) -> Result<()> {
        self.count_received();

        match frame {
            Downstream::Reply(reply) => self.dispatch(reply),
            Downstream::Session { name, status } => self.update_session(&name, status),
            Downstream::Call(call) => self.deliver_call(call),
            Downstream::Interest(interest) => self.deliver_interest(interest),
            Downstream::Ping => {
                trace!("ping");
                self.pongs.set(self.pongs.get() + 1);
            }
            Downstream::Welcome { .. } => warn!("unexpected WELCOME while connected"),
            Downstream::ByeBye => return Err(Error::transport("broker ended the session")),
        }
        Ok(())
    }

    fn dispatch(&self, reply: ReplyFrame) {
        let correlation_id = reply.correlation_id;
        let resolved = {
            let mut core = self.shared.core.borrow_mut();
            let resolved = core.dispatcher.resolve(reply);
            if resolved.is_some() {
                core.stats.replies_dispatched += 1;
            } else {
                core.stats.unknown_replies += 1;
            }
            resolved
        };

        match resolved {
            Some(Resolution::Request(entry, outcome)) => {
                trace!(correlation_id, ok = outcome.is_ok(), "reply dispatched");
                entry.complete(outcome);
            }
            Some(Resolution::Subscription(sink, outcome)) => {
                trace!(correlation_id, ok = outcome.is_ok(), "message dispatched");
                sink(outcome);
            }
            None => warn!(correlation_id, "reply for unknown request, discarding"),
        }
    }

    fn update_session(&self, name: &str, status: SessionStatus) {
        let transition = {
            let mut core = self.shared.core.borrow_mut();
            let transition = core.sessions.update(name, status);
            if transition.is_none() {
                core.stats.unknown_sessions += 1;
            }
            transition
        };

        match transition {
            Some(transition) => {
                debug!(session = %name, ?status, "session state");
                transition.notify();
            }
            None => warn!(session = %name, "state for unknown session, discarding"),
        }
    }

    fn deliver_call(&self, call: CallFrame) {
        let (sink, link) = {
            let mut core = self.shared.core.borrow_mut();
            let sink = core.sessions.call_sink(&call.name);
            match sink {
                Some(_) => core.stats.calls_dispatched += 1,
                None => core.stats.unknown_sessions += 1,
            }
            (sink, LinkRef::new(&self.shared, core.link_epoch))
        };

        match sink {
            Some(Some(sink)) => {
                trace!(session = %call.name, postref = call.postref, "call dispatched");
                sink(call, link);
            }
            Some(None) => {
                warn!(session = %call.name, "session has no call handler, dropping call");
            }
            None => warn!(session = %call.name, "call for unknown session, discarding"),
        }
    }

    fn deliver_interest(&self, interest: InterestFrame) {
        let (sink, link) = {
            let mut core = self.shared.core.borrow_mut();
            let sink = core.sessions.interest_sink(&interest.name);
            if sink.is_none() {
                core.stats.unknown_sessions += 1;
            }
            (sink, LinkRef::new(&self.shared, core.link_epoch))
        };

        match sink {
            Some(Some(sink)) => {
                trace!(
                    session = %interest.name,
                    interested = interest.interested,
                    "interest dispatched"
                );
                sink(interest, link);
            }
            Some(None) => debug!(session = %interest.name, "session ignores interest"),
            None => warn!(session = %interest.name, "interest for unknown session, discarding"),
        }
    }

    /// Wait for a wake-up or the next request deadline, then time out
    /// whatever is due.
    async fn idle(&self) {
        let next = self.shared.core.borrow().dispatcher.next_deadline();
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = self.shared.wake.notified() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            None => self.shared.wake.notified().await,
        }
        self.sweep_expired();
    }

    fn sweep_expired(&self) {
        let expired = {
            let mut core = self.shared.core.borrow_mut();
            let expired = core.dispatcher.expire(Instant::now());
            for entry in expired.iter().filter(|entry| !entry.is_sent()) {
                core.outbox.remove(entry.ticket);
            }
            expired
        };

        for entry in expired {
            let timeout = entry.timeout.unwrap_or_default();
            debug!(ticket = entry.ticket, ?timeout, "request timed out");
            entry.complete(Err(Error::Timeout(timeout)));
        }
    }

    async fn wait_for_retry(&self) {
        let deadline = self
            .shared
            .core
            .borrow()
            .backoff_deadline
            .unwrap_or_else(Instant::now);
        let backoff = sleep_until(deadline);
        tokio::pin!(backoff);

        loop {
            tokio::select! {
                _ = &mut backoff => break,
                _ = self.idle() => {
                    if self.shared.is_closed() {
                        return;
                    }
                }
            }
        }

        let attempt = self.shared.core.borrow().retry_count + 1;
        info!(attempt, "reconnecting");
        self.set_state(ConnectionState::Connecting);
    }

    fn on_connected(&self) {
        self.pongs.set(0);
        self.unflushed.set(false);

        let mut core = self.shared.core.borrow_mut();
        if core.state == ConnectionState::Closed {
            return;
        }
        core.state = ConnectionState::Connected;
        core.retry_count = 0;
        core.backoff.reset();
        core.backoff_deadline = None;
        core.stats.connects += 1;
        core.link_epoch += 1;

        // Standing registrations go out before any queued request
        core.control.clear();
        let logins = core.sessions.login_frames();
        let subscriptions = core.dispatcher.subscribe_frames();
        let (sessions, subscribed) = (logins.len(), subscriptions.len());
        core.control.extend(logins.into_iter().map(Upstream::Login));
        core.control.extend(subscriptions.into_iter().map(Upstream::Subscribe));
        info!(queued = core.outbox.len(), sessions, subscribed, "connected");
    }

    fn on_link_lost(&self, error: Error) {
        self.pongs.set(0);
        self.unflushed.set(false);

        let (failed, transitions) = {
            let mut core = self.shared.core.borrow_mut();
            if core.state == ConnectionState::Closed {
                return;
            }
            core.stats.disconnects += 1;
            warn!(error = %error, "link lost");
            core.control.clear();
            let transitions = core.sessions.relogin();

            let failed = match self.shared.config.disconnect_policy {
                DisconnectPolicy::FailFast => core.dispatcher.take_in_flight(),
                DisconnectPolicy::Hold => {
                    let resend = core.dispatcher.unsend_in_flight();
                    debug!(count = resend.len(), "holding in-flight requests for resend");
                    core.outbox.requeue_front(resend);
                    Vec::new()
                }
            };
            schedule_retry(&mut core);
            (failed, transitions)
        };

        for entry in failed {
            entry.complete(Err(Error::ConnectionClosed));
        }
        for transition in transitions {
            transition.notify();
        }
    }

    fn on_attempt_failed(&self, error: Error) {
        let mut core = self.shared.core.borrow_mut();
        if core.state == ConnectionState::Closed {
            return;
        }
        warn!(attempt = core.retry_count + 1, error = %error, "connect attempt failed");
        schedule_retry(&mut core);
    }

    async fn say_goodbye(&self, sink: &mut LinkSink) {
        let quit = async {
            sink.send(Upstream::Quit).await?;
            sink.close().await
        };
        match tokio::time::timeout(GOODBYE_GRACE, quit).await {
            Ok(Ok(())) => debug!("sent QUIT"),
            Ok(Err(e)) => debug!(error = %e, "could not send QUIT"),
            Err(_) => debug!("timed out sending QUIT"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut core = self.shared.core.borrow_mut();
        if core.state != ConnectionState::Closed && core.state != state {
            debug!(from = %core.state, to = %state, "state change");
            core.state = state;
        }
    }

    fn count_sent(&self) {
        self.shared.core.borrow_mut().stats.frames_sent += 1;
    }

    fn count_received(&self) {
        self.shared.core.borrow_mut().stats.frames_received += 1;
    }
}

fn schedule_retry(core: &mut Core) {
    core.retry_count += 1;
    let delay = core.backoff.next_delay();
    core.backoff_deadline = Some(Instant::now() + delay);
    core.state = ConnectionState::Reconnecting;
    info!(retry = core.retry_count, ?delay, "reconnect scheduled");
}
