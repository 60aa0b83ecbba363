use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendError};
use tracing::{debug, warn};

use crate::errors::BrokerError;

use super::{
    Broker, ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, PublishOptions, Publishing,
    QueueDeclareOptions,
};

// -----------------------------------------------------------------------------
// ----- MemoryBroker ----------------------------------------------------------

/// Single-process broker with AMQP routing rules.
///
/// The most recent publishes and acks are kept so callers can inspect what
/// went out; older ones fall off. Queues without a consumer hold at most
/// `max_ready` messages and drop the oldest beyond that.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Publishes and acks remembered for inspection.
    pub history: usize,
    /// Parked messages per queue.
    pub max_ready: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            history: 1024,
            max_ready: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub options: PublishOptions,
    pub message: Publishing,
}

// -----------------------------------------------------------------------------
// ----- MemoryBroker: Public --------------------------------------------------

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: MemoryLimits) -> Self {
        let state = BrokerState {
            limits,
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Oldest first, at most `MemoryLimits::history` entries.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.iter().cloned().collect()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().acked.iter().copied().collect()
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.exchanges.entry(name.to_string()).or_insert(kind);
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: QueueDeclareOptions,
    ) -> Result<String, BrokerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_string()
        };

        state.queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };

        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let BrokerState {
            queues,
            unacked,
            limits,
            ..
        } = &mut *state;

        let q = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

        if let Some(existing) = q.consumer.as_ref() {
            return Err(BrokerError::ConsumerExists {
                queue: queue.to_string(),
                tag: existing.tag.clone(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumer = Some(Consumer {
            tag: consumer_tag.to_string(),
            no_ack: options.no_ack,
            tx,
        });

        let backlog: Vec<Delivery> = q.ready.drain(..).collect();
        for delivery in backlog {
            q.offer(unacked, delivery, limits.max_ready);
        }

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        if !state.unacked.remove(&delivery_tag) {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        }

        let history = state.limits.history;
        push_bounded(&mut state.acked, delivery_tag, history);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        message: Publishing,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!("publish to '{exchange}'/'{routing_key}' matched no queue");
        }

        for queue in targets {
            state.enqueue(&queue, routing_key, message.body.clone());
        }

        let history = state.limits.history;
        let record = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            options,
            message,
        };
        push_bounded(&mut state.published, record, history);

        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        for q in state.queues.values_mut() {
            if q.consumer.as_ref().is_some_and(|c| c.tag == consumer_tag) {
                q.consumer = None;
            }
        }

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.closed = true;

        for q in state.queues.values_mut() {
            q.consumer = None;
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: BrokerState -------------------------------------------------

#[derive(Debug, Default)]
struct BrokerState {
    closed: bool,
    last_id: u64,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    limits: MemoryLimits,
    unacked: HashSet<u64>,
    acked: VecDeque<u64>,
    published: VecDeque<PublishedMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

impl BrokerState {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            let direct = self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string());
            return Ok(direct.into_iter().collect());
        }

        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && key_matches(kind, &b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, routing_key: &str, body: Bytes) {
        let delivery = Delivery {
            delivery_tag: self.next_id(),
            routing_key: routing_key.to_string(),
            body,
        };

        let max_ready = self.limits.max_ready;
        if let Some(q) = self.queues.get_mut(queue) {
            q.offer(&mut self.unacked, delivery, max_ready);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: QueueState --------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    consumer: Option<Consumer>,
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl QueueState {
    /// Hand to the consumer if there is a live one, otherwise park it.
    fn offer(&mut self, unacked: &mut HashSet<u64>, delivery: Delivery, max_ready: usize) {
        let Some(consumer) = self.consumer.as_ref() else {
            self.park(delivery, max_ready);
            return;
        };

        let tag = delivery.delivery_tag;
        let no_ack = consumer.no_ack;

        match consumer.tx.send(delivery) {
            Ok(()) => {
                if !no_ack {
                    unacked.insert(tag);
                }
            }
            Err(SendError(delivery)) => {
                // Receiver dropped without a cancel.
                self.consumer = None;
                self.park(delivery, max_ready);
            }
        }
    }

    fn park(&mut self, delivery: Delivery, max_ready: usize) {
        let routing_key = delivery.routing_key.clone();
        if push_bounded(&mut self.ready, delivery, max_ready) {
            warn!("queue full at {max_ready} ready messages; dropped oldest ({routing_key})");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

/// Append, dropping from the front past `cap`. Returns whether anything fell off.
fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, cap: usize) -> bool {
    buf.push_back(item);

    let mut dropped = false;
    while buf.len() > cap {
        buf.pop_front();
        dropped = true;
    }
    dropped
}

// -----------------------------------------------------------------------------
// ----- Internal: Routing -----------------------------------------------------

fn key_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

// `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && topic_matches(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && topic_matches(rest, &words[1..]),
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
