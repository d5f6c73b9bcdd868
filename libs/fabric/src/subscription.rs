//! Topic subscriptions
//!
//! A subscription receives every message a session publishes on one of its
//! topics. Like session logins it survives reconnects: the connection sends
//! the SUBSCRIBE again on every new link until the subscription is dropped.

use std::fmt;

use bytes::Bytes;

use crate::codec::CorrelationId;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::outbox::Ticket;

pub struct Subscription {
    connection: Connection,
    name: String,
    topic: Bytes,
    receipt: Option<(CorrelationId, Ticket)>,
}

impl Subscription {
    pub(crate) fn new(
        connection: Connection,
        name: String,
        topic: Bytes,
        receipt: (CorrelationId, Ticket),
    ) -> Self {
        Self {
            connection,
            name,
            topic,
            receipt: Some(receipt),
        }
    }

    /// Session publishing the topic
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &[u8] {
        &self.topic
    }

    /// Id the broker tags this subscription's messages with
    pub fn correlation_id(&self) -> Option<u32> {
        self.receipt.map(|(id, _)| id.get())
    }

    pub fn is_active(&self) -> bool {
        self.receipt.is_some()
    }

    /// Stop receiving messages. The handler never runs again.
    pub fn unsubscribe(&mut self) -> Result<()> {
        let (id, key) = self
            .receipt
            .take()
            .ok_or_else(|| Error::invalid_state("already unsubscribed"))?;
        self.connection.unsubscribe(id, key);
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some((id, key)) = self.receipt.take() {
            self.connection.unsubscribe(id, key);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("correlation_id", &self.correlation_id())
            .finish()
    }
}
