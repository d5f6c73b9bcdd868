//! Scripted broker for end-to-end tests
//!
//! Runs as a task on the test's own event loop, accepts connections one
//! after the other, greets each with WELCOME and answers requests through
//! a reactor closure. Tests can also push frames or cut the link.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use courier_fabric::codec::{
    BrokerCodec, Downstream, LoginFrame, ReplyFrame, RequestFrame, SubscribeFrame, Upstream,
};
use courier_fabric::transport::BoxedStream;
use courier_fabric::EventLoop;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Decides the reply to a request; gets the 1-based connection number
pub type Reactor = Rc<dyn Fn(&RequestFrame, usize) -> Option<Downstream>>;

pub struct Behavior {
    pub welcome: bool,
    pub reactor: Reactor,
}

impl Behavior {
    /// Reply "pong" to every bidirectional request
    pub fn pong() -> Self {
        Self::reacting(|frame, _| reply(frame, "pong"))
    }

    /// Reply with the request payload
    pub fn echo() -> Self {
        Self::reacting(|frame, _| {
            let id = frame.correlation_id?;
            Some(Downstream::Reply(ReplyFrame::ok(id.get(), frame.payload.clone())))
        })
    }

    /// Never reply on its own
    pub fn silent() -> Self {
        Self::reacting(|_, _| None)
    }

    pub fn reacting(reactor: impl Fn(&RequestFrame, usize) -> Option<Downstream> + 'static) -> Self {
        Self {
            welcome: true,
            reactor: Rc::new(reactor),
        }
    }

    pub fn without_welcome(mut self) -> Self {
        self.welcome = false;
        self
    }
}

pub fn reply(frame: &RequestFrame, payload: &'static str) -> Option<Downstream> {
    let id = frame.correlation_id?;
    Some(Downstream::Reply(ReplyFrame::ok(id.get(), payload)))
}

enum Control {
    Push(Downstream),
    Raw(Vec<u8>),
    DropLink,
}

enum Listener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

pub struct FakeBroker {
    uri: String,
    received: Rc<RefCell<Vec<Upstream>>>,
    accepted: Rc<Cell<usize>>,
    control: mpsc::UnboundedSender<Control>,
}

impl FakeBroker {
    /// Start on an ephemeral loopback port
    pub fn start(event_loop: &EventLoop, behavior: Behavior) -> Self {
        Self::start_on_port(event_loop, 0, behavior)
    }

    pub fn start_on_port(event_loop: &EventLoop, port: u16, behavior: Behavior) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let uri = format!("nxtcp://{}", listener.local_addr().unwrap());
        Self::spawn(event_loop, uri, Listener::Tcp(listener), behavior)
    }

    pub fn start_unix(event_loop: &EventLoop, path: &Path, behavior: Behavior) -> Self {
        let listener = std::os::unix::net::UnixListener::bind(path).unwrap();
        listener.set_nonblocking(true).unwrap();
        let uri = format!("unix://{}", path.display());
        Self::spawn(event_loop, uri, Listener::Unix(listener), behavior)
    }

    fn spawn(event_loop: &EventLoop, uri: String, listener: Listener, behavior: Behavior) -> Self {
        let received = Rc::new(RefCell::new(Vec::new()));
        let accepted = Rc::new(Cell::new(0));
        let (control, control_rx) = mpsc::unbounded_channel();

        event_loop.spawn(serve(
            listener,
            behavior,
            received.clone(),
            accepted.clone(),
            control_rx,
        ));

        Self {
            uri,
            received,
            accepted,
            control,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.get()
    }

    pub fn received(&self) -> Vec<Upstream> {
        self.received.borrow().clone()
    }

    pub fn requests(&self) -> Vec<RequestFrame> {
        self.received
            .borrow()
            .iter()
            .filter_map(|frame| match frame {
                Upstream::Request(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn logins(&self) -> Vec<LoginFrame> {
        self.received
            .borrow()
            .iter()
            .filter_map(|frame| match frame {
                Upstream::Login(login) => Some(login.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn subscribes(&self) -> Vec<SubscribeFrame> {
        self.received
            .borrow()
            .iter()
            .filter_map(|frame| match frame {
                Upstream::Subscribe(subscribe) => Some(subscribe.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn saw(&self, frame: &Upstream) -> bool {
        self.received.borrow().contains(frame)
    }

    /// Send a frame on the current (or next) connection
    pub fn push(&self, frame: Downstream) {
        let _ = self.control.send(Control::Push(frame));
    }

    /// Write bytes as-is, bypassing the codec
    pub fn push_raw(&self, bytes: &[u8]) {
        let _ = self.control.send(Control::Raw(bytes.to_vec()));
    }

    pub fn reply(&self, correlation_id: u32, payload: &'static str) {
        self.push(Downstream::Reply(ReplyFrame::ok(correlation_id, payload)));
    }

    /// Close the current connection from the broker side
    pub fn drop_link(&self) {
        let _ = self.control.send(Control::DropLink);
    }
}

async fn serve(
    listener: Listener,
    behavior: Behavior,
    received: Rc<RefCell<Vec<Upstream>>>,
    accepted: Rc<Cell<usize>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    enum Bound {
        Tcp(TcpListener),
        Unix(UnixListener),
    }

    let bound = match listener {
        Listener::Tcp(l) => Bound::Tcp(TcpListener::from_std(l).unwrap()),
        Listener::Unix(l) => Bound::Unix(UnixListener::from_std(l).unwrap()),
    };

    loop {
        let stream: BoxedStream = match &bound {
            Bound::Tcp(l) => match l.accept().await {
                Ok((s, _)) => Box::new(s),
                Err(_) => return,
            },
            Bound::Unix(l) => match l.accept().await {
                Ok((s, _)) => Box::new(s),
                Err(_) => return,
            },
        };
        accepted.set(accepted.get() + 1);
        let connection_no = accepted.get();

        let mut framed = Framed::new(stream, BrokerCodec::new());
        if behavior.welcome {
            let welcome = Downstream::Welcome {
                server_version: 1,
                protocol_version: 1,
            };
            if framed.send(welcome).await.is_err() {
                continue;
            }
        }

        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        received.borrow_mut().push(frame.clone());
                        match frame {
                            Upstream::Request(request) => {
                                let answer = (behavior.reactor)(&request, connection_no);
                                if let Some(answer) = answer {
                                    if framed.send(answer).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Upstream::Quit => break,
                            _ => {}
                        }
                    }
                    _ => break,
                },
                command = control.recv() => match command {
                    Some(Control::Push(frame)) => {
                        if framed.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Control::Raw(bytes)) => {
                        if framed.flush().await.is_err()
                            || framed.get_mut().write_all(&bytes).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Control::DropLink) => break,
                    None => return,
                },
            }
        }
    }
}

/// Run the loop until `condition` holds or `limit` passes
pub fn wait_for(event_loop: &EventLoop, limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    event_loop.run_until(async move {
        tokio::time::timeout(limit, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .is_ok()
    })
}

/// An ephemeral port with nothing listening on it
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Collected handler outcomes, rendered as strings for easy comparison
pub type Outcomes = Rc<RefCell<Vec<String>>>;

pub fn record(outcomes: &Outcomes, label: &'static str) -> impl FnOnce(courier_fabric::Result<String>) + 'static {
    let outcomes = outcomes.clone();
    move |outcome| {
        let text = match outcome {
            Ok(value) => format!("{}:ok:{}", label, value),
            Err(e) => format!("{}:err:{}", label, e),
        };
        outcomes.borrow_mut().push(text);
    }
}
