use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::BrokerError;

use super::{
    Broker, ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, PublishOptions, Publishing,
    QueueDeclareOptions,
};

// -----------------------------------------------------------------------------
// ----- AmqpBroker ------------------------------------------------------------

/// RabbitMQ (AMQP 0-9-1) broker: one connection, one channel.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

// -----------------------------------------------------------------------------
// ----- AmqpBroker: Static ----------------------------------------------------

impl AmqpBroker {
    pub async fn connect(uri: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        info!("amqp channel {} open", channel.id());
        Ok(Self {
            connection,
            channel,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- AmqpBroker: Broker ----------------------------------------------------

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel
            .exchange_declare(name, exchange_kind(kind), options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, BrokerError> {
        let options = lapin::options::QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..Default::default()
        };

        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let options = BasicConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            ..Default::default()
        };

        let mut consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tag = consumer_tag.to_string();

        // Forward until the server cancels us or the receiver goes away.
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                let delivery = match item {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!("consumer {tag} stream failed: {e}");
                        break;
                    }
                };

                let forwarded = Delivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    body: Bytes::from(delivery.data),
                };

                if tx.send(forwarded).is_err() {
                    break;
                }
            }

            debug!("consumer {tag} stream ended");
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        message: Publishing,
    ) -> Result<(), BrokerError> {
        let options = BasicPublishOptions {
            mandatory: options.mandatory,
            immediate: options.immediate,
        };

        // No publisher confirms on this channel; the confirm resolves at once.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                options,
                &message.body,
                publish_properties(&message),
            )
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        self.channel.close(200, "shutdown").await?;
        self.connection.close(200, "shutdown").await?;

        info!("amqp connection closed");
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Mapping -----------------------------------------------------

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn publish_properties(message: &Publishing) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &message.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let properties = BasicProperties::default()
        .with_headers(headers)
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_delivery_mode(message.delivery_mode as u8)
        .with_priority(message.priority);

    if message.content_encoding.is_empty() {
        return properties;
    }
    properties.with_content_encoding(ShortString::from(message.content_encoding.clone()))
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_reply_properties() {
        let mut message = Publishing::transient(Bytes::from_static(b"result"));
        message.headers.insert("x-cid".into(), "c-1".into());

        let props = publish_properties(&message);

        assert_eq!(props.delivery_mode(), &Some(1));
        assert_eq!(props.priority(), &Some(0));
        assert_eq!(
            props.content_type().as_ref().map(ShortString::as_str),
            Some("text/plain")
        );
        assert!(props.content_encoding().is_none());
        assert_eq!(props.headers().as_ref().map(|h| h.inner().len()), Some(1));
    }

    #[test]
    fn exchange_kinds_map_one_to_one() {
        assert!(matches!(
            exchange_kind(ExchangeKind::Direct),
            lapin::ExchangeKind::Direct
        ));
        assert!(matches!(
            exchange_kind(ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        ));
        assert!(matches!(
            exchange_kind(ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        ));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
