//! AMQP 0-9-1 backend built on `lapin`.
//!
//! Enabled with the `amqp` cargo feature. Each [`Session`] is one AMQP
//! channel; the [`Connection`] is one AMQP connection. The broker itself
//! enforces queue equivalence, exclusivity and dead-lettering here.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use tracing::{debug, info};

use super::{
    Acker, Connection, DEAD_LETTER_EXCHANGE_ARG, Delivery, DeliveryStream, ExchangeKind, Message,
    QueueDeclaration, QueueInfo, Session,
};
use crate::pubsub::retry::{BackoffPolicy, retry_with_backoff};
use crate::utils::error::{PubSubError, Result};

const REPLY_SUCCESS: u16 = 200;

/// Dials the broker, retrying connection failures with `backoff`.
pub async fn connect(url: &str, backoff: &BackoffPolicy) -> Result<AmqpConnection> {
    let inner = retry_with_backoff(backoff, "amqp connect", || async {
        lapin::Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))
    })
    .await?;
    info!("connected to AMQP broker");
    Ok(AmqpConnection { inner })
}

pub struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        debug!(channel_id = channel.id(), "channel opened");
        Ok(Box::new(AmqpSession { channel }))
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

pub struct AmqpSession {
    channel: lapin::Channel,
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, kind, options, FieldTable::default())
            .await
            .map_err(|e| PubSubError::Topology(e.to_string()))
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<QueueInfo> {
        let options = QueueDeclareOptions {
            durable: declaration.durable,
            auto_delete: declaration.auto_delete,
            exclusive: declaration.exclusive,
            ..QueueDeclareOptions::default()
        };
        let mut arguments = FieldTable::default();
        if let Some(dlx) = &declaration.dead_letter_exchange {
            arguments.insert(
                ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        let queue = self
            .channel
            .queue_declare(&declaration.name, options, arguments)
            .await
            .map_err(|e| PubSubError::Topology(e.to_string()))?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| PubSubError::Topology(e.to_string()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))
    }

    async fn publish(&self, exchange: &str, message: Message) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.as_str()))
            .with_headers(to_field_table(&message.headers));
        if let Some(id) = &message.message_id {
            properties = properties.with_message_id(ShortString::from(id.as_str()));
        }
        if let Ok(timestamp) = u64::try_from(message.timestamp) {
            properties = properties.with_timestamp(timestamp);
        }

        // no confirm handshake: the returned PublisherConfirm is dropped
        self.channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| PubSubError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| PubSubError::Topology(e.to_string()))?;
        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_delivery)
                    .map_err(|e| PubSubError::Connection(e.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| PubSubError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.acker
            .nack(options)
            .await
            .map_err(|e| PubSubError::Ack(e.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let message = Message {
        routing_key: delivery.routing_key.as_str().to_string(),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string())
            .unwrap_or_default(),
        payload: delivery.data.clone(),
        headers: properties
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        timestamp: (*properties.timestamp())
            .and_then(|ts| i64::try_from(ts).ok())
            .unwrap_or_default(),
    };
    Delivery {
        message,
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        acker: Arc::new(AmqpAcker {
            acker: delivery.acker,
        }),
    }
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }
    table
}

fn from_field_table(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                AMQPValue::LongLongInt(n) => n.to_string(),
                AMQPValue::LongInt(n) => n.to_string(),
                AMQPValue::ShortInt(n) => n.to_string(),
                AMQPValue::LongUInt(n) => n.to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}
