//! Session/delivery backend consumed by STOMP sessions, and an in-memory
//! implementation.
//!
//! The backend owns destinations and message state. A session attaches an
//! outbox channel; messages for its subscriptions are pushed there as
//! [`Delivery`] values and turned into MESSAGE frames by the session.
//!
//! Every delivery stays in flight until the session acknowledges or rejects
//! it, auto mode included: the session acknowledges auto deliveries when it
//! hands them to the client. Deliveries still queued in the outbox when their
//! subscription goes away are therefore requeued, never lost.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relaymq_core::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::BackendError;

/// Acknowledgement mode of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AckMode {
    /// Delivered means consumed.
    #[default]
    Auto,
    /// Cumulative acknowledgement.
    Client,
    /// Per-message acknowledgement.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }

    /// Returns true if deliveries wait for ACK or NACK.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, Self::Auto)
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "client" => Ok(Self::Client),
            "client-individual" => Ok(Self::ClientIndividual),
            other => Err(format!("unknown ack mode {other:?}")),
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub destination: String,
    /// Application headers in the order they were sent.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A message handed to a session for one of its subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subscription_id: String,
    /// Generation returned by [`DeliveryBackend::subscribe`]. A subscription
    /// id reused after UNSUBSCRIBE gets a new generation.
    pub generation: u64,
    pub message: Message,
}

/// The session/delivery operations a STOMP session relies on.
#[async_trait]
pub trait DeliveryBackend: Send + Sync {
    /// Starts routing deliveries for `session` to `outbox`.
    async fn attach(&self, session: &SessionId, outbox: mpsc::UnboundedSender<Delivery>);

    /// Stops routing to `session`. Its subscriptions are dropped and
    /// unacknowledged messages become available again.
    async fn detach(&self, session: &SessionId);

    /// Stores a message and returns its id.
    async fn send(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Result<String, BackendError>;

    /// Adds a subscription and returns its generation.
    async fn subscribe(
        &self,
        session: &SessionId,
        subscription_id: &str,
        destination: &str,
        ack_mode: AckMode,
    ) -> Result<u64, BackendError>;

    /// Drops a subscription; its in-flight messages are requeued.
    async fn unsubscribe(&self, session: &SessionId, subscription_id: &str)
    -> Result<(), BackendError>;

    /// Marks an in-flight message consumed.
    async fn acknowledge(&self, session: &SessionId, message_id: &str) -> Result<(), BackendError>;

    /// Marks an in-flight message rejected; it is discarded.
    async fn reject(&self, session: &SessionId, message_id: &str) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SubscriberKey {
    session: SessionId,
    subscription_id: String,
}

#[derive(Debug)]
struct Subscriber {
    key: SubscriberKey,
    generation: u64,
}

#[derive(Debug, Default)]
struct Destination {
    queue: VecDeque<Message>,
    subscribers: Vec<Subscriber>,
    cursor: usize,
}

#[derive(Debug)]
struct InFlight {
    sequence: u64,
    subscription_id: String,
    message: Message,
}

#[derive(Debug, Default)]
struct BrokerState {
    destinations: HashMap<String, Destination>,
    outboxes: HashMap<SessionId, mpsc::UnboundedSender<Delivery>>,
    in_flight: HashMap<SessionId, HashMap<String, InFlight>>,
    next_message: u64,
    next_sequence: u64,
    next_generation: u64,
}

impl BrokerState {
    /// Hands queued messages of `destination` to its subscribers, round robin.
    fn pump(&mut self, destination: &str) {
        let Some(dest) = self.destinations.get_mut(destination) else {
            return;
        };
        while !dest.queue.is_empty() && !dest.subscribers.is_empty() {
            let index = dest.cursor % dest.subscribers.len();
            let subscriber = &dest.subscribers[index];
            let Some(outbox) = self.outboxes.get(&subscriber.key.session) else {
                // Session went away without detaching.
                dest.subscribers.remove(index);
                continue;
            };
            let Some(message) = dest.queue.pop_front() else {
                break;
            };
            let delivery = Delivery {
                subscription_id: subscriber.key.subscription_id.clone(),
                generation: subscriber.generation,
                message: message.clone(),
            };
            if outbox.send(delivery).is_err() {
                dest.queue.push_front(message);
                let session = subscriber.key.session.clone();
                self.outboxes.remove(&session);
                dest.subscribers.retain(|s| s.key.session != session);
                continue;
            }
            trace!(
                message_id = %message.id,
                session = %subscriber.key.session,
                subscription = %subscriber.key.subscription_id,
                "Delivered"
            );
            self.next_sequence += 1;
            self.in_flight
                .entry(subscriber.key.session.clone())
                .or_default()
                .insert(
                    message.id.clone(),
                    InFlight {
                        sequence: self.next_sequence,
                        subscription_id: subscriber.key.subscription_id.clone(),
                        message,
                    },
                );
            dest.cursor = index + 1;
        }
    }

    /// Returns in-flight messages matching `filter` to the front of their
    /// queues, oldest first, and reports the destinations touched.
    fn requeue<F>(&mut self, session: &SessionId, filter: F) -> Vec<String>
    where
        F: Fn(&InFlight) -> bool,
    {
        let Some(flights) = self.in_flight.get_mut(session) else {
            return Vec::new();
        };
        let ids: Vec<String> = flights
            .iter()
            .filter(|(_, flight)| filter(flight))
            .map(|(id, _)| id.clone())
            .collect();
        let mut returned: Vec<InFlight> = ids.iter().filter_map(|id| flights.remove(id)).collect();
        if flights.is_empty() {
            self.in_flight.remove(session);
        }

        returned.sort_by_key(|flight| std::cmp::Reverse(flight.sequence));
        let mut touched = Vec::new();
        for flight in returned {
            let destination = flight.message.destination.clone();
            self.destinations
                .entry(destination.clone())
                .or_default()
                .queue
                .push_front(flight.message);
            if !touched.contains(&destination) {
                touched.push(destination);
            }
        }
        touched
    }
}

/// In-memory FIFO broker.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting in a destination's queue.
    pub fn queued(&self, destination: &str) -> usize {
        self.state
            .lock()
            .destinations
            .get(destination)
            .map_or(0, |d| d.queue.len())
    }

    /// Messages delivered to a session and not yet acknowledged.
    pub fn in_flight(&self, session: &SessionId) -> usize {
        self.state.lock().in_flight.get(session).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl DeliveryBackend for MemoryBroker {
    async fn attach(&self, session: &SessionId, outbox: mpsc::UnboundedSender<Delivery>) {
        debug!(session = %session, "Session attached");
        self.state.lock().outboxes.insert(session.clone(), outbox);
    }

    async fn detach(&self, session: &SessionId) {
        let mut state = self.state.lock();
        state.outboxes.remove(session);
        let mut touched: Vec<String> = Vec::new();
        for (name, dest) in state.destinations.iter_mut() {
            let before = dest.subscribers.len();
            dest.subscribers.retain(|s| &s.key.session != session);
            if dest.subscribers.len() != before {
                touched.push(name.clone());
            }
        }
        for destination in state.requeue(session, |_| true) {
            if !touched.contains(&destination) {
                touched.push(destination);
            }
        }
        for destination in touched {
            state.pump(&destination);
        }
        debug!(session = %session, "Session detached");
    }

    async fn send(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.next_message += 1;
        let id = format!("ID:relaymq-{}", state.next_message);
        state
            .destinations
            .entry(destination.to_string())
            .or_default()
            .queue
            .push_back(Message {
                id: id.clone(),
                destination: destination.to_string(),
                headers,
                body,
            });
        state.pump(destination);
        Ok(id)
    }

    async fn subscribe(
        &self,
        session: &SessionId,
        subscription_id: &str,
        destination: &str,
        ack_mode: AckMode,
    ) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        if !state.outboxes.contains_key(session) {
            return Err(BackendError::Detached);
        }
        let key = SubscriberKey {
            session: session.clone(),
            subscription_id: subscription_id.to_string(),
        };
        let taken = state
            .destinations
            .values()
            .any(|d| d.subscribers.iter().any(|s| s.key == key));
        if taken {
            return Err(BackendError::DuplicateSubscription {
                id: subscription_id.to_string(),
            });
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .destinations
            .entry(destination.to_string())
            .or_default()
            .subscribers
            .push(Subscriber { key, generation });
        state.pump(destination);
        trace!(session = %session, subscription = %subscription_id, generation, ack = %ack_mode, "Subscribed");
        Ok(generation)
    }

    async fn unsubscribe(
        &self,
        session: &SessionId,
        subscription_id: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let mut found = false;
        for dest in state.destinations.values_mut() {
            let before = dest.subscribers.len();
            dest.subscribers.retain(|s| {
                !(&s.key.session == session && s.key.subscription_id == subscription_id)
            });
            found |= dest.subscribers.len() != before;
        }
        if !found {
            return Err(BackendError::UnknownSubscription {
                id: subscription_id.to_string(),
            });
        }
        for destination in state.requeue(session, |f| f.subscription_id == subscription_id) {
            state.pump(&destination);
        }
        Ok(())
    }

    async fn acknowledge(&self, session: &SessionId, message_id: &str) -> Result<(), BackendError> {
        self.settle(session, message_id)
    }

    async fn reject(&self, session: &SessionId, message_id: &str) -> Result<(), BackendError> {
        self.settle(session, message_id)
    }
}

impl MemoryBroker {
    fn settle(&self, session: &SessionId, message_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let removed = state
            .in_flight
            .get_mut(session)
            .and_then(|flights| flights.remove(message_id));
        match removed {
            Some(_) => Ok(()),
            None => Err(BackendError::UnknownMessage {
                message_id: message_id.to_string(),
            }),
        }
    }
}
