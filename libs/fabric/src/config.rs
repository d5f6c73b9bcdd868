//! Connection configuration
//!
//! Every knob has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! connect_timeout = "3s"
//! handshake_timeout = "2s"
//! request_timeout = "5s"
//! disconnect_policy = "fail-fast"
//!
//! [backoff]
//! initial = "500ms"
//! multiplier = 2.0
//! max = "30s"
//! jitter = 0.25
//!
//! [queue]
//! capacity = 1024
//! overflow = "reject"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{Error, Result};

/// Upper bound for `backoff.max`
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// What happens to a new request when the outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// `send()` fails with `QueueFull`
    #[default]
    Reject,
    /// The oldest queued request fails with `QueueFull` to make room
    DropOldest,
}

/// What happens to in-flight requests when the link is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectPolicy {
    /// Fail in-flight requests with `ConnectionClosed` immediately
    #[default]
    FailFast,
    /// Re-send in-flight requests after reconnecting, ahead of queued ones
    Hold,
}

/// Reconnect backoff: exponential growth with additive jitter, capped at `max`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    #[serde(with = "humantime_serde")]
    pub initial: Duration,

    /// Growth factor applied after every failed attempt
    pub multiplier: f64,

    /// Ceiling for any single delay
    #[serde(with = "humantime_serde")]
    pub max: Duration,

    /// Random extra delay, as a fraction of the current base
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial.is_zero() {
            return Err(Error::config("backoff.initial must be positive"));
        }
        if self.max < self.initial {
            return Err(Error::config("backoff.max must be at least backoff.initial"));
        }
        if self.max > MAX_BACKOFF {
            return Err(Error::config(format!(
                "backoff.max must not exceed {:?}",
                MAX_BACKOFF
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config("backoff.multiplier must be a finite value >= 1.0"));
        }
        // Larger jitter would let one delay overshoot the next base.
        if self.jitter.is_nan() || self.jitter < 0.0 || self.jitter > self.multiplier - 1.0 {
            return Err(Error::config(format!(
                "backoff.jitter must be within 0.0..={}",
                self.multiplier - 1.0
            )));
        }
        Ok(())
    }
}

/// Bounded outbound queue used while the link is down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::Reject,
        }
    }
}

/// Configuration for a broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Timeout for opening the stream
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long to wait for the broker's WELCOME frame. `None` skips the
    /// handshake and treats an open stream as connected.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Option<Duration>,

    /// Default per-request timeout, overridable per request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,

    pub backoff: BackoffConfig,

    pub queue: QueueConfig,

    pub disconnect_policy: DisconnectPolicy,

    /// Set `TCP_NODELAY` on TCP streams
    pub nodelay: bool,

    /// Largest frame accepted from the broker
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Some(Duration::from_secs(2)),
            request_timeout: Some(Duration::from_secs(5)),
            backoff: BackoffConfig::default(),
            queue: QueueConfig::default(),
            disconnect_policy: DisconnectPolicy::FailFast,
            nodelay: true,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for a broker on the same host or LAN.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Some(Duration::from_millis(500)),
            backoff: BackoffConfig {
                initial: Duration::from_millis(20),
                multiplier: 2.0,
                max: Duration::from_secs(1),
                jitter: 0.25,
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML and validate it
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect_timeout must be positive"));
        }
        if self.handshake_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("handshake_timeout must be positive when set"));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("request_timeout must be positive when set"));
        }
        if self.queue.capacity == 0 {
            return Err(Error::config("queue.capacity must be at least 1"));
        }
        if self.max_frame_size < MAX_PAYLOAD_SIZE {
            return Err(Error::config(format!(
                "max_frame_size must be at least {} bytes",
                MAX_PAYLOAD_SIZE
            )));
        }
        self.backoff.validate()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_queue(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.queue = QueueConfig { capacity, overflow };
        self
    }

    pub fn with_disconnect_policy(mut self, policy: DisconnectPolicy) -> Self {
        self.disconnect_policy = policy;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}
