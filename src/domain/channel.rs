// src/domain/channel.rs

//! Broker channel domain abstractions.
//!
//! This module defines the interface the RPC client needs from a message
//! broker: publish a message with a routing key and message properties,
//! declare a queue, consume a queue as a stream of deliveries with manual
//! acknowledgement, and close.
//!
//! The vocabulary follows AMQP 0-9-1 (default exchange, routing key,
//! correlation id, reply-to, per-message expiration) because that is the
//! shape of the protocol, but nothing here depends on a concrete broker
//! client library. Concrete implementations live under `src/transport/`.
//!
//! Correlation, disposal and timeouts are handled by the client layer.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{CorrelationId, Result};

/// Name of a broker queue.
///
/// With the default exchange a queue name doubles as the routing key, so the
/// same type is used for both. Cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueName(pub Arc<str>);

impl QueueName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<T> From<T> for QueueName
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        QueueName(value.into())
    }
}

/// Options for declaring a queue.
///
/// An empty `name` asks the broker to pick a unique name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A shared, non-durable queue with a fixed name (e.g. a service queue).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A reply queue: owned exclusively by the declaring channel and removed
    /// when that channel goes away. Broker-named unless `name` is given.
    pub fn reply(name: Option<String>) -> Self {
        Self {
            name: name.unwrap_or_default(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Message properties carried alongside a body.
///
/// All fields are optional; a fire-and-forget call sets only `content_type`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<Arc<str>>,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<QueueName>,

    /// Per-message expiration. On the wire this is the whole number of
    /// milliseconds rendered as a decimal string.
    pub expiration: Option<Duration>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: impl Into<Arc<str>>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_reply_to(mut self, queue: QueueName) -> Self {
        self.reply_to = Some(queue);
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Expiration formatted the way AMQP brokers expect it.
    pub fn expiration_millis(&self) -> Option<String> {
        self.expiration.map(|ttl| ttl.as_millis().to_string())
    }
}

/// An outbound message.
#[derive(Clone, Debug)]
pub struct Publishing {
    /// Exchange to publish to. The RPC client always uses the default
    /// exchange (`""`).
    pub exchange: Arc<str>,
    pub routing_key: QueueName,
    pub body: Bytes,
    pub properties: MessageProperties,
}

impl Publishing {
    /// Publish `body` to `queue` through the default exchange.
    pub fn to_queue(queue: QueueName, body: Bytes, properties: MessageProperties) -> Self {
        // ---
        Self {
            exchange: Arc::from(""),
            routing_key: queue,
            body,
            properties,
        }
    }
}

/// Acknowledges deliveries back to the broker.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<()>;
}

pub type AckerPtr = Arc<dyn Acknowledger>;

/// An inbound message read from a consumed queue.
///
/// Deliveries are consumed with manual acknowledgement; until [`ack`](Self::ack)
/// succeeds the broker may redeliver.
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: QueueName,
    pub body: Bytes,
    pub properties: MessageProperties,
    pub acker: AckerPtr,
}

impl Delivery {
    /// Acknowledge this delivery.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Correlation id echoed by the remote side, if any.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.properties.correlation_id.as_ref()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("body", &self.body)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Sequential stream of deliveries from one consumed queue.
///
/// The stream ends (`recv()` yields `None`) when the owning channel is
/// closed or the broker cancels the consumer.
#[derive(Debug)]
pub struct DeliveryStream {
    // ---
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inbox.recv().await
    }
}

/// Broker channel abstraction.
///
/// One channel is owned by one RPC client for its whole lifetime. The client
/// declares its reply queue on it, consumes that queue, and publishes every
/// request through it.
///
/// Implementations must ensure that:
/// - once `consume()` returns, messages routed to that queue afterwards are
///   delivered on the returned stream;
/// - publishing to a queue that does not exist is not an error (the message
///   is dropped, as with a non-mandatory AMQP publish);
/// - after `close()`, outstanding delivery streams end and `publish()` fails.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    // ---
    /// Identifier used in log lines and as the consumer tag prefix.
    fn channel_id(&self) -> &str;

    /// Publish a message.
    async fn publish(&self, msg: Publishing) -> Result<()>;

    /// Declare a queue and return its (possibly broker-assigned) name.
    async fn declare_queue(&self, opts: QueueOptions) -> Result<QueueName>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &QueueName) -> Result<DeliveryStream>;

    /// Close the channel and release broker resources held by it.
    async fn close(&self) -> Result<()>;
}

/// Shared broker channel pointer.
pub type ChannelPtr = Arc<dyn BrokerChannel>;
