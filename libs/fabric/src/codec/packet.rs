//! Frames exchanged with the broker

use std::fmt;
use std::num::NonZeroU32;

use bytes::Bytes;

pub const LOGIN: u8 = 0x01;
pub const LOGOUT: u8 = 0x03;
pub const REQUEST: u8 = 0x04;
pub const POST: u8 = 0x06;
pub const SUBSCRIBE: u8 = 0x08;
pub const UNSUBSCRIBE: u8 = 0x10;
pub const PONG: u8 = 0x81;
pub const QUIT: u8 = 0x84;

pub const SESSION: u8 = 0x02;
pub const CALL: u8 = 0x05;
pub const MESSAGE: u8 = 0x07;
pub const INTEREST: u8 = 0x09;
pub const PING: u8 = 0x80;
pub const WELCOME: u8 = 0x82;
pub const BYEBYE: u8 = 0x83;

/// Request and call flag: no reply is expected
pub const FLAG_UNIDIRECTIONAL: u8 = 0x01;

pub const LOGIN_PERSIST: u8 = 0x01;
pub const LOGIN_STANDBY: u8 = 0x02;
pub const LOGIN_ENFORCE: u8 = 0x04;

/// Protocol version this client speaks
pub const PROTOCOL_VERSION: u32 = 1;

/// Correlation id of a bidirectional request. Zero is reserved for
/// fire-and-forget requests and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(NonZeroU32);

impl CorrelationId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome reported by the broker for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    /// The broker gave up waiting for the target service
    Timeout,
    /// No service is registered under the target name
    Unreachable,
}

impl ReplyStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::Timeout),
            2 => Some(Self::Unreachable),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Timeout => 1,
            Self::Unreachable => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub target: String,
    /// `None` marks the request unidirectional
    pub correlation_id: Option<CorrelationId>,
    /// Broker-side timeout in milliseconds, 0 for none
    pub timeout_ms: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub correlation_id: u32,
    pub status: ReplyStatus,
    /// Empty unless `status` is `Ok`
    pub payload: Bytes,
}

impl ReplyFrame {
    pub fn ok(correlation_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            status: ReplyStatus::Ok,
            payload: payload.into(),
        }
    }

    pub fn failed(correlation_id: u32, status: ReplyStatus) -> Self {
        Self {
            correlation_id,
            status,
            payload: Bytes::new(),
        }
    }
}

/// How a session claims its name at the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoginOptions {
    /// Keep the name registered while this client is disconnected
    pub persist: bool,
    /// Wait as a standby if another client holds the name
    pub standby: bool,
    /// Take the name over from whoever holds it
    pub enforce: bool,
}

impl LoginOptions {
    pub fn flags(self) -> u8 {
        let mut flags = 0;
        if self.persist {
            flags |= LOGIN_PERSIST;
        }
        if self.standby {
            flags |= LOGIN_STANDBY;
        }
        if self.enforce {
            flags |= LOGIN_ENFORCE;
        }
        flags
    }

    pub fn from_flags(flags: u8) -> Self {
        Self {
            persist: flags & LOGIN_PERSIST != 0,
            standby: flags & LOGIN_STANDBY != 0,
            enforce: flags & LOGIN_ENFORCE != 0,
        }
    }
}

/// Session state reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ended,
    Standby,
    Active,
}

impl SessionStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ended),
            1 => Some(Self::Standby),
            2 => Some(Self::Active),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ended => 0,
            Self::Standby => 1,
            Self::Active => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFrame {
    pub name: String,
    pub options: LoginOptions,
}

/// Answer to a call or publication for an interest, addressed by postref
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFrame {
    pub postref: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFrame {
    /// Messages for the subscription arrive under this id
    pub correlation_id: CorrelationId,
    pub name: String,
    pub topic: Bytes,
}

/// A request routed to a session this client is logged in as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub unidirectional: bool,
    /// Where the answer goes; meaningful for the current link only
    pub postref: u32,
    pub name: String,
    pub payload: Bytes,
}

/// Subscribers appeared for (or left) a topic of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestFrame {
    pub interested: bool,
    pub postref: u32,
    pub name: String,
    pub topic: Bytes,
}

/// Client to broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Login(LoginFrame),
    Logout { name: String },
    Request(RequestFrame),
    Post(PostFrame),
    Subscribe(SubscribeFrame),
    Unsubscribe { name: String, topic: Bytes },
    Pong,
    Quit,
}

impl Upstream {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login(_) => "LOGIN",
            Self::Logout { .. } => "LOGOUT",
            Self::Request(_) => "REQUEST",
            Self::Post(_) => "POST",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::Pong => "PONG",
            Self::Quit => "QUIT",
        }
    }
}

/// Broker to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downstream {
    Session { name: String, status: SessionStatus },
    Call(CallFrame),
    Reply(ReplyFrame),
    Interest(InterestFrame),
    Ping,
    Welcome {
        server_version: u32,
        protocol_version: u32,
    },
    ByeBye,
}
