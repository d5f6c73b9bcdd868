//! Pending request table
//!
//! Maps correlation ids to the completion waiting for the reply, or to the
//! sink of a subscription, which takes any number of messages. Ids are
//! allocated sequentially from 1, wrap around, skip 0 and skip any id still
//! in use.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::codec::{CorrelationId, ReplyFrame, ReplyStatus, RequestFrame, SubscribeFrame};
use crate::error::{Error, Result};
use crate::outbox::{Queued, Ticket};
use crate::request::RequestState;

/// Delivers the raw reply payload, or the failure, to a request
pub(crate) type Completion = Box<dyn FnOnce(Result<Bytes>)>;

/// Receives every message published on a subscription
pub(crate) type MessageSink = Rc<dyn Fn(Result<Bytes>)>;

/// A standing subscription; re-sent after every reconnect
pub(crate) struct Subscribed {
    pub key: Ticket,
    pub frame: SubscribeFrame,
    pub sink: MessageSink,
}

impl fmt::Debug for Subscribed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribed")
            .field("key", &self.key)
            .field("frame", &self.frame)
            .finish()
    }
}

/// Where a message from the broker goes
pub(crate) enum Resolution {
    /// The reply to a request, which is now out of the table
    Request(Entry, Result<Bytes>),
    Subscription(MessageSink, Result<Bytes>),
}

pub(crate) struct Entry {
    pub ticket: Ticket,
    pub frame: RequestFrame,
    pub state: Rc<Cell<RequestState>>,
    pub completion: Completion,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    sent_order: Option<u64>,
}

impl Entry {
    pub fn new(
        ticket: Ticket,
        frame: RequestFrame,
        state: Rc<Cell<RequestState>>,
        completion: Completion,
        timeout: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            ticket,
            frame,
            state,
            completion,
            timeout,
            deadline,
            sent_order: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sent_order.is_some()
    }

    /// Hand the outcome to the request. Must not be called with the
    /// connection state borrowed.
    pub fn complete(self, outcome: Result<Bytes>) {
        (self.completion)(outcome)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("ticket", &self.ticket)
            .field("target", &self.frame.target)
            .field("state", &self.state.get())
            .field("deadline", &self.deadline)
            .field("sent", &self.is_sent())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    entries: HashMap<CorrelationId, Entry>,
    subscriptions: HashMap<CorrelationId, Subscribed>,
    deadlines: BTreeSet<(Instant, CorrelationId)>,
    next_id: u32,
    send_seq: u64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn starting_at(next_id: u32) -> Self {
        Self {
            entries: HashMap::new(),
            subscriptions: HashMap::new(),
            deadlines: BTreeSet::new(),
            next_id,
            send_seq: 0,
        }
    }

    /// Pick the next free correlation id
    pub fn allocate(&mut self) -> Result<CorrelationId> {
        if self.entries.len() + self.subscriptions.len() >= u32::MAX as usize - 1 {
            return Err(Error::invalid_state("correlation ids exhausted"));
        }

        loop {
            let candidate = CorrelationId::new(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if let Some(id) = candidate {
                if !self.entries.contains_key(&id) && !self.subscriptions.contains_key(&id) {
                    return Ok(id);
                }
            }
        }
    }

    pub fn insert(&mut self, id: CorrelationId, entry: Entry) {
        if let Some(deadline) = entry.deadline {
            self.deadlines.insert((deadline, id));
        }
        self.entries.insert(id, entry);
    }

    #[cfg(test)]
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Record that the request's frame has been written
    pub fn mark_sent(&mut self, id: CorrelationId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.sent_order = Some(self.send_seq);
            self.send_seq += 1;
            entry.state.set(RequestState::Sent);
        }
    }

    /// Match a message to its request or subscription. Unknown ids return
    /// `None`.
    pub fn resolve(&mut self, reply: ReplyFrame) -> Option<Resolution> {
        let id = CorrelationId::new(reply.correlation_id)?;

        if let Some(subscribed) = self.subscriptions.get(&id) {
            // Any failure status means the session cannot be reached
            let outcome = match reply.status {
                ReplyStatus::Ok => Ok(reply.payload),
                _ => Err(Error::Unreachable(subscribed.frame.name.clone())),
            };
            return Some(Resolution::Subscription(subscribed.sink.clone(), outcome));
        }

        let entry = self.take(id)?;
        let outcome = match reply.status {
            ReplyStatus::Ok => Ok(reply.payload),
            ReplyStatus::Timeout => Err(Error::Timeout(entry.timeout.unwrap_or_default())),
            ReplyStatus::Unreachable => Err(Error::Unreachable(entry.frame.target.clone())),
        };
        Some(Resolution::Request(entry, outcome))
    }

    pub fn subscribe(&mut self, subscribed: Subscribed) {
        self.subscriptions
            .insert(subscribed.frame.correlation_id, subscribed);
    }

    /// Remove a subscription, provided `id` still belongs to `key`
    pub fn unsubscribe(&mut self, id: CorrelationId, key: Ticket) -> Option<Subscribed> {
        match self.subscriptions.get(&id) {
            Some(subscribed) if subscribed.key == key => self.subscriptions.remove(&id),
            _ => None,
        }
    }

    /// SUBSCRIBE frames for every standing subscription, oldest first
    pub fn subscribe_frames(&self) -> Vec<SubscribeFrame> {
        let mut subscribed: Vec<&Subscribed> = self.subscriptions.values().collect();
        subscribed.sort_by_key(|s| s.key);
        subscribed.into_iter().map(|s| s.frame.clone()).collect()
    }

    pub fn drain_subscriptions(&mut self) -> Vec<Subscribed> {
        let mut subscribed: Vec<Subscribed> =
            self.subscriptions.drain().map(|(_, s)| s).collect();
        subscribed.sort_by_key(|s| s.key);
        subscribed
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Remove a request, provided `id` still belongs to `ticket`
    pub fn cancel(&mut self, id: CorrelationId, ticket: Ticket) -> Option<Entry> {
        match self.entries.get(&id) {
            Some(entry) if entry.ticket == ticket => self.take(id),
            _ => None,
        }
    }

    /// Remove every request whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<Entry> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(entry) = self.entries.remove(&id) {
                expired.push(entry);
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|&(deadline, _)| deadline)
    }

    /// Remove written requests, oldest write first
    pub fn take_in_flight(&mut self) -> Vec<Entry> {
        let ids = self.in_flight_ids();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }

    /// Turn written requests back into queued frames, oldest write first.
    /// They stay registered and become `Pending` again.
    pub fn unsend_in_flight(&mut self) -> Vec<Queued> {
        let ids = self.in_flight_ids();
        ids.into_iter()
            .filter_map(|id| {
                let entry = self.entries.get_mut(&id)?;
                entry.sent_order = None;
                entry.state.set(RequestState::Pending);
                Some(Queued {
                    ticket: entry.ticket,
                    frame: entry.frame.clone(),
                    state: entry.state.clone(),
                })
            })
            .collect()
    }

    pub fn drain_all(&mut self) -> Vec<Entry> {
        self.deadlines.clear();
        let mut entries: Vec<Entry> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.ticket);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn in_flight_ids(&self) -> Vec<CorrelationId> {
        let mut sent: Vec<(u64, CorrelationId)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| entry.sent_order.map(|order| (order, *id)))
            .collect();
        sent.sort_unstable();
        sent.into_iter().map(|(_, id)| id).collect()
    }

    fn take(&mut self, id: CorrelationId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if let Some(deadline) = entry.deadline {
            self.deadlines.remove(&(deadline, id));
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Outcomes = Rc<RefCell<Vec<(Ticket, String)>>>;

    fn entry(ticket: Ticket, deadline: Option<Instant>, outcomes: &Outcomes) -> Entry {
        let outcomes = outcomes.clone();
        Entry::new(
            ticket,
            RequestFrame {
                target: "svc".to_string(),
                correlation_id: None,
                timeout_ms: 0,
                payload: Bytes::new(),
            },
            Rc::new(Cell::new(RequestState::Pending)),
            Box::new(move |outcome| {
                let text = match outcome {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => e.to_string(),
                };
                outcomes.borrow_mut().push((ticket, text));
            }),
            Some(Duration::from_secs(1)),
            deadline,
        )
    }

    fn register(dispatcher: &mut Dispatcher, ticket: Ticket, outcomes: &Outcomes) -> CorrelationId {
        let id = dispatcher.allocate().unwrap();
        dispatcher.insert(id, entry(ticket, None, outcomes));
        id
    }

    fn request(resolution: Option<Resolution>) -> (Entry, Result<Bytes>) {
        match resolution {
            Some(Resolution::Request(entry, outcome)) => (entry, outcome),
            Some(Resolution::Subscription(..)) => panic!("resolved to a subscription"),
            None => panic!("not resolved"),
        }
    }

    fn subscribed(dispatcher: &mut Dispatcher, key: Ticket, seen: &Outcomes) -> CorrelationId {
        let id = dispatcher.allocate().unwrap();
        let seen = seen.clone();
        dispatcher.subscribe(Subscribed {
            key,
            frame: SubscribeFrame {
                correlation_id: id,
                name: "ticker".to_string(),
                topic: Bytes::from_static(b"eur"),
            },
            sink: Rc::new(move |outcome| {
                let text = match outcome {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => e.to_string(),
                };
                seen.borrow_mut().push((key, text));
            }),
        });
        id
    }

    #[test]
    fn subscriptions_take_many_messages() {
        let seen = Outcomes::default();
        let mut dispatcher = Dispatcher::new();
        let id = subscribed(&mut dispatcher, 3, &seen);

        for payload in ["1.08", "1.09"] {
            match dispatcher.resolve(ReplyFrame::ok(id.get(), payload)) {
                Some(Resolution::Subscription(sink, outcome)) => sink(outcome),
                _ => panic!("expected a subscription message"),
            }
        }
        match dispatcher.resolve(ReplyFrame::failed(id.get(), ReplyStatus::Unreachable)) {
            Some(Resolution::Subscription(sink, outcome)) => sink(outcome),
            _ => panic!("expected a subscription message"),
        }

        assert_eq!(
            *seen.borrow(),
            vec![
                (3, "1.08".to_string()),
                (3, "1.09".to_string()),
                (3, "Target unreachable: ticker".to_string()),
            ]
        );
        assert_eq!(dispatcher.subscription_count(), 1);
        assert_eq!(dispatcher.len(), 0);
    }

    #[test]
    fn subscription_ids_are_never_reused_while_standing() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::starting_at(1);
        let standing = subscribed(&mut dispatcher, 1, &outcomes);
        assert_eq!(standing.get(), 1);

        dispatcher.next_id = 1;
        assert_eq!(register(&mut dispatcher, 2, &outcomes).get(), 2);

        assert!(dispatcher.unsubscribe(standing, 9).is_none());
        assert!(dispatcher.unsubscribe(standing, 1).is_some());
        assert_eq!(dispatcher.subscription_count(), 0);
        assert!(dispatcher.resolve(ReplyFrame::ok(1, "late")).is_none());
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::new();
        let ids: Vec<u32> = (0..3)
            .map(|t| register(&mut dispatcher, t, &outcomes).get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn ids_wrap_skipping_zero_and_live_ids() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::starting_at(1);
        let first = register(&mut dispatcher, 0, &outcomes);
        assert_eq!(first.get(), 1);

        dispatcher.next_id = u32::MAX;
        let last = register(&mut dispatcher, 1, &outcomes);
        assert_eq!(last.get(), u32::MAX);

        // 0 is reserved and 1 is still live
        let wrapped = register(&mut dispatcher, 2, &outcomes);
        assert_eq!(wrapped.get(), 2);
    }

    #[test]
    fn resolve_hands_back_entry_and_payload() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::new();
        let id = register(&mut dispatcher, 9, &outcomes);

        let (entry, outcome) = request(dispatcher.resolve(ReplyFrame::ok(id.get(), "pong")));
        entry.complete(outcome);

        assert_eq!(*outcomes.borrow(), vec![(9, "pong".to_string())]);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn unknown_reply_is_ignored() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::new();
        register(&mut dispatcher, 1, &outcomes);

        assert!(dispatcher.resolve(ReplyFrame::ok(77, "late")).is_none());
        assert!(dispatcher.resolve(ReplyFrame::ok(0, "zero")).is_none());
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn failure_statuses_map_to_errors() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::new();
        let a = register(&mut dispatcher, 1, &outcomes);
        let b = register(&mut dispatcher, 2, &outcomes);

        let (_, outcome) =
            request(dispatcher.resolve(ReplyFrame::failed(a.get(), ReplyStatus::Timeout)));
        assert!(matches!(outcome, Err(Error::Timeout(d)) if d == Duration::from_secs(1)));

        let (_, outcome) =
            request(dispatcher.resolve(ReplyFrame::failed(b.get(), ReplyStatus::Unreachable)));
        assert!(matches!(outcome, Err(Error::Unreachable(target)) if target == "svc"));
    }

    #[test]
    fn cancel_checks_ticket() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::new();
        let id = register(&mut dispatcher, 4, &outcomes);

        assert!(dispatcher.cancel(id, 5).is_none());
        assert!(dispatcher.cancel(id, 4).is_some());
        assert!(!dispatcher.contains(id));
    }

    #[test]
    fn expire_removes_due_entries_only() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::new();
        let now = Instant::now();

        let soon = dispatcher.allocate().unwrap();
        dispatcher.insert(soon, entry(1, Some(now + Duration::from_millis(10)), &outcomes));
        let later = dispatcher.allocate().unwrap();
        dispatcher.insert(later, entry(2, Some(now + Duration::from_secs(10)), &outcomes));
        register(&mut dispatcher, 3, &outcomes);

        assert_eq!(dispatcher.next_deadline(), Some(now + Duration::from_millis(10)));

        let expired = dispatcher.expire(now + Duration::from_secs(1));
        assert_eq!(expired.iter().map(|e| e.ticket).collect::<Vec<_>>(), vec![1]);
        assert_eq!(dispatcher.next_deadline(), Some(now + Duration::from_secs(10)));
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn in_flight_in_write_order() {
        let outcomes = Outcomes::default();
        let mut dispatcher = Dispatcher::new();
        let a = register(&mut dispatcher, 1, &outcomes);
        let b = register(&mut dispatcher, 2, &outcomes);
        let c = register(&mut dispatcher, 3, &outcomes);

        dispatcher.mark_sent(c);
        dispatcher.mark_sent(a);

        let requeued = dispatcher.unsend_in_flight();
        assert_eq!(requeued.iter().map(|q| q.ticket).collect::<Vec<_>>(), vec![3, 1]);
        assert!(requeued.iter().all(|q| q.state.get() == RequestState::Pending));

        dispatcher.mark_sent(b);
        let taken = dispatcher.take_in_flight();
        assert_eq!(taken.iter().map(|e| e.ticket).collect::<Vec<_>>(), vec![2]);
        assert_eq!(dispatcher.len(), 2);
    }
}
