//! Message broker capability.
//!
//! The RPC server only needs a handful of AMQP-shaped channel operations.
//! Connection and channel management belong to whichever client implements
//! [`Broker`]: [`AmqpBroker`] talks to RabbitMQ, [`MemoryBroker`] stays
//! in-process.

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::{MemoryBroker, MemoryLimits, PublishedMessage};

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::BrokerError;

// -----------------------------------------------------------------------------
// ----- Broker ----------------------------------------------------------------

pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Returns the queue name as the broker knows it.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), BrokerError>;

    /// The stream ends when the consumer is cancelled or the channel closes.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// An empty `exchange` is the default exchange: `routing_key` names the
    /// destination queue directly.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        message: Publishing,
    ) -> Result<(), BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn shutdown(&self) -> Result<(), BrokerError>;
}

// -----------------------------------------------------------------------------
// ----- Options ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDeclareOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    /// Broker acknowledges on send; the consumer never acks.
    pub no_ack: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

// -----------------------------------------------------------------------------
// ----- Messages --------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub headers: HashMap<String, String>,
    pub content_type: String,
    pub content_encoding: String,
    pub body: Bytes,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
}

impl Publishing {
    /// Non-persistent plain body; lost if the broker restarts.
    pub fn transient(body: Bytes) -> Self {
        Self {
            headers: HashMap::new(),
            content_type: "text/plain".to_string(),
            content_encoding: String::new(),
            body,
            delivery_mode: DeliveryMode::Transient,
            priority: 0,
        }
    }
}
