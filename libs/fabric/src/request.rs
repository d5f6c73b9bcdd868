//! Requests and their completion contract
//!
//! A request's handler runs exactly once with the decoded reply or an error,
//! unless the request is cancelled first, in which case it never runs.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use courier_core::{Serializer, StringSerializer};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::channel::{validate_target, Issued};
use crate::codec::MAX_PAYLOAD_SIZE;
use crate::connection::{Connection, Receipt, Submission};
use crate::dispatcher::Completion;
use crate::error::{Error, Result};

/// Callback receiving the outcome of one request
pub type Handler<V> = Box<dyn FnOnce(Result<V>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Not yet written to the broker
    Pending,
    /// Written, waiting for the reply
    Sent,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RequestState {
    /// State a request ends in after delivering `outcome`
    pub fn after<V>(outcome: &Result<V>) -> Self {
        match outcome {
            Ok(_) => Self::Completed,
            Err(Error::Timeout(_)) => Self::TimedOut,
            Err(Error::Cancelled) => Self::Cancelled,
            Err(_) => Self::Failed,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A single call to a broker target
///
/// Nothing is sent until [`Request::send`]. A request without a handler is
/// fire-and-forget: the broker is told not to reply and the request is
/// `Completed` as soon as it is written.
pub struct Request<S: Serializer = StringSerializer> {
    connection: Connection,
    serializer: Rc<S>,
    target: String,
    payload: Option<S::Value>,
    handler: Option<Handler<S::Value>>,
    timeout: Option<Duration>,
    state: Rc<Cell<RequestState>>,
    receipt: Option<Receipt>,
    issued: Rc<Issued>,
    created_at: Instant,
}

impl<S> Request<S>
where
    S: Serializer + 'static,
    S::Value: 'static,
{
    pub(crate) fn new(
        connection: Connection,
        serializer: Rc<S>,
        issued: Rc<Issued>,
        target: String,
        payload: S::Value,
    ) -> Self {
        let timeout = connection.config().request_timeout;
        Self {
            connection,
            serializer,
            target,
            payload: Some(payload),
            handler: None,
            timeout,
            state: Rc::new(Cell::new(RequestState::Pending)),
            receipt: None,
            issued,
            created_at: Instant::now(),
        }
    }

    /// Install the callback for the outcome. Only allowed before `send()`.
    pub fn set_handler<F>(&mut self, handler: F) -> Result<&mut Self>
    where
        F: FnOnce(Result<S::Value>) + 'static,
    {
        self.ensure_unsent("set a handler on")?;
        self.handler = Some(Box::new(handler));
        Ok(self)
    }

    /// Override the connection's default request timeout
    pub fn timeout(&mut self, timeout: Duration) -> Result<&mut Self> {
        self.ensure_unsent("change the timeout of")?;
        if timeout.is_zero() {
            return Err(Error::config("request timeout must be positive"));
        }
        self.timeout = Some(timeout);
        Ok(self)
    }

    /// Wait for the reply as long as it takes
    pub fn no_timeout(&mut self) -> Result<&mut Self> {
        self.ensure_unsent("change the timeout of")?;
        self.timeout = None;
        Ok(self)
    }

    /// Serialize the payload and hand the request to the connection
    ///
    /// The request stays `Pending` until the frame is written, which may be
    /// after a reconnect.
    pub fn send(&mut self) -> Result<()> {
        self.ensure_unsent("send")?;
        validate_target(&self.target).map_err(|e| self.fail(e))?;

        let value = self
            .payload
            .take()
            .ok_or_else(|| Error::invalid_state("request payload already consumed"))?;
        let bytes = self
            .serializer
            .encode(&value)
            .map_err(|e| self.fail(e.into()))?;
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(self.fail(Error::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_SIZE,
            }));
        }

        let completion = self
            .handler
            .take()
            .map(|handler| completion(self.serializer.clone(), self.state.clone(), handler));

        let receipt = self
            .connection
            .submit(Submission {
                target: self.target.clone(),
                payload: Bytes::from(bytes),
                timeout: self.timeout,
                completion,
                state: self.state.clone(),
            })
            .map_err(|e| self.fail(e))?;

        trace!(service = %self.target, ticket = receipt.ticket, "request submitted");
        self.issued.record(receipt, self.state.clone());
        self.receipt = Some(receipt);
        Ok(())
    }

    /// Withdraw the request. Its handler will never run.
    pub fn cancel(&mut self) -> Result<()> {
        self.handler = None;
        withdraw(&self.connection, self.receipt, &self.state)
    }

    /// Send the request and wait for its outcome
    ///
    /// Dropping the returned future before it resolves cancels the request.
    pub fn response(mut self) -> Response<S::Value> {
        let (tx, rx) = oneshot::channel();
        let installed = self
            .set_handler(move |outcome| {
                let _ = tx.send(outcome);
            })
            .map(|_| ());
        let early = match installed {
            Ok(()) => self.send().err(),
            Err(e) => Some(e),
        };

        Response {
            rx,
            early,
            guard: CancelGuard {
                connection: self.connection.clone(),
                receipt: self.receipt,
                state: self.state.clone(),
            },
        }
    }

    pub fn state(&self) -> RequestState {
        self.state.get()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Correlation id on the wire, once sent with a handler
    pub fn correlation_id(&self) -> Option<u32> {
        self.receipt
            .and_then(|receipt| receipt.correlation_id)
            .map(|id| id.get())
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn current_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn ensure_unsent(&self, action: &str) -> Result<()> {
        if self.receipt.is_some() {
            return Err(Error::invalid_state(format!(
                "cannot {} a request that was already sent",
                action
            )));
        }
        match self.state.get() {
            RequestState::Pending => Ok(()),
            state => Err(Error::invalid_state(format!(
                "cannot {} a {} request",
                action, state
            ))),
        }
    }

    fn fail(&self, error: Error) -> Error {
        self.state.set(RequestState::Failed);
        error
    }
}

impl<S: Serializer> fmt::Debug for Request<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("target", &self.target)
            .field("state", &self.state.get())
            .field("timeout", &self.timeout)
            .field("receipt", &self.receipt)
            .finish()
    }
}

/// Wrap a typed handler into the byte-level completion the dispatcher holds
fn completion<S>(
    serializer: Rc<S>,
    state: Rc<Cell<RequestState>>,
    handler: Handler<S::Value>,
) -> Completion
where
    S: Serializer + 'static,
    S::Value: 'static,
{
    Box::new(move |outcome: Result<Bytes>| {
        let value = outcome.and_then(|bytes| serializer.decode(&bytes).map_err(Error::from));
        state.set(RequestState::after(&value));
        handler(value);
    })
}

pub(crate) fn withdraw(
    connection: &Connection,
    receipt: Option<Receipt>,
    state: &Cell<RequestState>,
) -> Result<()> {
    let current = state.get();
    if !current.is_live() {
        return Err(Error::invalid_state(format!(
            "cannot cancel a {} request",
            current
        )));
    }

    state.set(RequestState::Cancelled);
    if let Some(receipt) = receipt {
        connection.withdraw(receipt);
    }
    Ok(())
}

struct CancelGuard {
    connection: Connection,
    receipt: Option<Receipt>,
    state: Rc<Cell<RequestState>>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.state.get().is_live() {
            let _ = withdraw(&self.connection, self.receipt, &self.state);
        }
    }
}

/// Future returned by [`Request::response`]
pub struct Response<V> {
    rx: oneshot::Receiver<Result<V>>,
    early: Option<Error>,
    guard: CancelGuard,
}

impl<V> Response<V> {
    pub fn state(&self) -> RequestState {
        self.guard.state.get()
    }
}

impl<V> Future for Response<V> {
    type Output = Result<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<V>> {
        if let Some(error) = self.early.take() {
            return Poll::Ready(Err(error));
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::endpoint::Endpoint;
    use crate::event_loop::EventLoop;

    fn idle_connection(event_loop: &EventLoop) -> Connection {
        Connection::new(
            event_loop,
            Endpoint::tcp("127.0.0.1", 1),
            ConnectionConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn state_after_outcome() {
        assert_eq!(RequestState::after::<()>(&Ok(())), RequestState::Completed);
        assert_eq!(
            RequestState::after::<()>(&Err(Error::Timeout(Duration::from_secs(1)))),
            RequestState::TimedOut
        );
        assert_eq!(
            RequestState::after::<()>(&Err(Error::Cancelled)),
            RequestState::Cancelled
        );
        assert_eq!(
            RequestState::after::<()>(&Err(Error::ConnectionClosed)),
            RequestState::Failed
        );
    }

    #[test]
    fn handler_after_send_is_rejected() {
        let event_loop = EventLoop::new().unwrap();
        let channel = idle_connection(&event_loop).channel("demo_target").unwrap();

        let mut request = channel.call("demo_payload".to_string());
        request.set_handler(|_| {}).unwrap();
        request.send().unwrap();
        assert_eq!(request.state(), RequestState::Pending);
        assert_eq!(request.correlation_id(), Some(1));

        assert!(matches!(request.set_handler(|_| {}), Err(Error::InvalidState(_))));
        assert!(matches!(request.send(), Err(Error::InvalidState(_))));
        assert!(matches!(
            request.timeout(Duration::from_secs(1)),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn usage_errors_name_the_problem() {
        let event_loop = EventLoop::new().unwrap();
        let channel = idle_connection(&event_loop).channel("demo_target").unwrap();

        let mut request = channel.call("demo_payload".to_string());
        request.send().unwrap();
        match request.send() {
            Err(Error::InvalidState(message)) => {
                assert_eq!(message, "cannot send a request that was already sent")
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut rejected = channel.request("bad name", "x".to_string());
        assert!(rejected.send().is_err());
        match rejected.timeout(Duration::from_secs(1)) {
            Err(Error::InvalidState(message)) => {
                assert_eq!(message, "cannot change the timeout of a failed request")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unrepresentable_timeout_means_no_deadline() {
        let event_loop = EventLoop::new().unwrap();
        let connection = idle_connection(&event_loop);
        let channel = connection.channel("demo_target").unwrap();

        let mut request = channel.call("demo_payload".to_string());
        request.timeout(Duration::MAX).unwrap();
        request.set_handler(|_| {}).unwrap();
        request.send().unwrap();

        assert_eq!(request.state(), RequestState::Pending);
        assert_eq!(request.current_timeout(), Some(Duration::MAX));
        assert_eq!(connection.pending(), 1);
        assert_eq!(connection.next_deadline(), None);
    }

    #[test]
    fn cancel_is_final() {
        let event_loop = EventLoop::new().unwrap();
        let connection = idle_connection(&event_loop);
        let channel = connection.channel("demo_target").unwrap();

        let mut request = channel.call("demo_payload".to_string());
        request.set_handler(|_| panic!("cancelled handler ran")).unwrap();
        request.send().unwrap();
        assert_eq!(connection.queued(), 1);

        request.cancel().unwrap();
        assert_eq!(request.state(), RequestState::Cancelled);
        assert_eq!(connection.queued(), 0);
        assert_eq!(connection.pending(), 0);
        assert!(matches!(request.cancel(), Err(Error::InvalidState(_))));
        assert!(matches!(request.send(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn invalid_target_fails_the_request() {
        let event_loop = EventLoop::new().unwrap();
        let channel = idle_connection(&event_loop).channel("demo_target").unwrap();

        let mut request = channel.request("no spaces allowed", "x".to_string());
        assert!(matches!(request.send(), Err(Error::InvalidTarget(_))));
        assert_eq!(request.state(), RequestState::Failed);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let event_loop = EventLoop::new().unwrap();
        let channel = idle_connection(&event_loop).channel("demo_target").unwrap();

        let mut request = channel.call("x".repeat(MAX_PAYLOAD_SIZE + 1));
        assert!(matches!(
            request.send(),
            Err(Error::PayloadTooLarge { max: MAX_PAYLOAD_SIZE, .. })
        ));
        assert_eq!(request.state(), RequestState::Failed);
    }

    #[test]
    fn dropped_response_cancels() {
        let event_loop = EventLoop::new().unwrap();
        let connection = idle_connection(&event_loop);
        let channel = connection.channel("demo_target").unwrap();

        let response = channel.call("demo_payload".to_string()).response();
        assert_eq!(response.state(), RequestState::Pending);
        assert_eq!(connection.pending(), 1);

        drop(response);
        assert_eq!(connection.pending(), 0);
        assert_eq!(connection.queued(), 0);
    }
}
