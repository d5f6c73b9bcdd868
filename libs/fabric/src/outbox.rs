//! Bounded FIFO of request frames waiting for a connected stream

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::codec::RequestFrame;
use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{Error, Result};
use crate::request::RequestState;

/// Per-connection identity of a submitted request. Unlike correlation ids,
/// tickets are never reused and fire-and-forget requests get one too.
pub(crate) type Ticket = u64;

#[derive(Debug)]
pub(crate) struct Queued {
    pub ticket: Ticket,
    pub frame: RequestFrame,
    pub state: Rc<Cell<RequestState>>,
}

#[derive(Debug)]
pub(crate) struct Outbox {
    queue: VecDeque<Queued>,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl Outbox {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: config.capacity,
            overflow: config.overflow,
        }
    }

    /// Queue a frame at the back.
    ///
    /// When full, `Reject` refuses the new frame and `DropOldest` evicts the
    /// front entry and hands it back so its request can be failed.
    pub fn push(&mut self, item: Queued) -> Result<Option<Queued>> {
        if self.queue.len() < self.capacity {
            self.queue.push_back(item);
            return Ok(None);
        }

        match self.overflow {
            OverflowPolicy::Reject => Err(Error::QueueFull {
                capacity: self.capacity,
            }),
            OverflowPolicy::DropOldest => {
                let evicted = self.queue.pop_front();
                self.queue.push_back(item);
                Ok(evicted)
            }
        }
    }

    /// Put frames back at the front, keeping their relative order. Ignores
    /// the capacity: these frames were already admitted once.
    pub fn requeue_front(&mut self, items: Vec<Queued>) {
        for item in items.into_iter().rev() {
            self.queue.push_front(item);
        }
    }

    pub fn pop_front(&mut self) -> Option<Queued> {
        self.queue.pop_front()
    }

    pub fn remove(&mut self, ticket: Ticket) -> Option<Queued> {
        let index = self.queue.iter().position(|q| q.ticket == ticket)?;
        self.queue.remove(index)
    }

    pub fn drain(&mut self) -> Vec<Queued> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
