//! AMQP broker channel implementation using `lapin`.
//!
//! One [`LapinChannel`] wraps one AMQP connection and one channel on it.
//!
//! ## Concurrency model
//!
//! - `lapin::Channel` is internally synchronized, so publishes and queue
//!   declarations are issued directly from the calling task.
//! - Each `consume()` spawns a **consumer task** that drains the lapin
//!   consumer and forwards every delivery, unacknowledged, into the returned
//!   [`DeliveryStream`]. Acknowledgement stays with the receiver.
//! - `close()` aborts the consumer tasks (ending their streams) and closes the
//!   channel and the connection.
//!
//! ## Message mapping
//!
//! | domain                         | AMQP                               |
//! |--------------------------------|------------------------------------|
//! | `Publishing::exchange`         | exchange (`""` = default exchange) |
//! | `Publishing::routing_key`      | routing key                        |
//! | `MessageProperties::content_type`   | `content-type`                |
//! | `MessageProperties::correlation_id` | `correlation-id`              |
//! | `MessageProperties::reply_to`       | `reply-to`                    |
//! | `MessageProperties::expiration`     | `expiration` (ms as string)   |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use lapin::{
    //
    acker::Acker,
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Acknowledger,
    BrokerChannel,
    ChannelPtr,
    CorrelationId,
    Delivery,
    DeliveryStream,
    MessageProperties,
    Publishing,
    QueueName,
    QueueOptions,
    Result,
    RpcError,
};

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn transport_err(what: &str, e: impl std::fmt::Display) -> RpcError {
    RpcError::Transport(format!("amqp: {what}: {e}"))
}

/// AMQP broker channel backed by lapin.
pub struct LapinChannel {
    // ---
    channel_id: String,
    connection: Connection,
    channel: Channel,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LapinChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ChannelClosed);
        }
        Ok(())
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    // ---
    let mut out = BasicProperties::default();

    if let Some(content_type) = &props.content_type {
        out = out.with_content_type(content_type.as_ref().into());
    }
    if let Some(id) = &props.correlation_id {
        out = out.with_correlation_id(id.as_str().into());
    }
    if let Some(reply_to) = &props.reply_to {
        out = out.with_reply_to(reply_to.as_str().into());
    }
    if let Some(expiration) = props.expiration_millis() {
        out = out.with_expiration(expiration.into());
    }

    out
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    // ---
    MessageProperties {
        content_type: props
            .content_type()
            .as_ref()
            .map(|s| Arc::from(s.as_str())),
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|s| CorrelationId::from(s.as_str())),
        reply_to: props.reply_to().as_ref().map(|s| QueueName::from(s.as_str())),
        expiration: props
            .expiration()
            .as_ref()
            .and_then(|s| s.as_str().parse::<u64>().ok())
            .map(Duration::from_millis),
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait::async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        // ---
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| transport_err("ack failed", e))
    }
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    // ---
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn publish(&self, msg: Publishing) -> Result<()> {
        // ---
        self.ensure_open()?;

        let properties = to_basic_properties(&msg.properties);

        self.channel
            .basic_publish(
                msg.exchange.as_ref().into(),
                msg.routing_key.as_str().into(),
                BasicPublishOptions::default(),
                &msg.body,
                properties,
            )
            .await
            .map_err(|e| transport_err("publish failed", e))?;

        log_debug!("[{}] published to `{}`", self.channel_id, msg.routing_key);
        Ok(())
    }

    async fn declare_queue(&self, opts: QueueOptions) -> Result<QueueName> {
        // ---
        self.ensure_open()?;

        let declare_opts = QueueDeclareOptions {
            passive: false,
            durable: opts.durable,
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(opts.name.as_str().into(), declare_opts, FieldTable::default())
            .await
            .map_err(|e| transport_err("queue declare failed", e))?;

        let name = QueueName::from(queue.name().as_str());
        log_info!("[{}] declared queue `{name}`", self.channel_id);
        Ok(name)
    }

    async fn consume(&self, queue: &QueueName) -> Result<DeliveryStream> {
        // ---
        self.ensure_open()?;

        let consumer = self
            .channel
            .basic_consume(
                queue.as_str().into(),
                format!("{}-consumer", self.channel_id).as_str().into(),
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("consume failed", e))?;

        log_info!("[{}] consuming `{queue}`", self.channel_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_id = self.channel_id.clone();
        let routing_queue = queue.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                let delivery = match delivery_result {
                    Ok(delivery) => delivery,
                    Err(_e) => {
                        log_error!("[{channel_id}] consumer error on `{routing_queue}`: {_e}");
                        break;
                    }
                };

                let delivery = Delivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: routing_queue.clone(),
                    properties: from_basic_properties(&delivery.properties),
                    body: Bytes::from(delivery.data),
                    acker: Arc::new(LapinAcker {
                        acker: delivery.acker,
                    }),
                };

                if tx.send(delivery).is_err() {
                    log_debug!("[{channel_id}] delivery stream dropped, stopping consumer");
                    break;
                }
            }

            log_info!("[{channel_id}] consumer task ended for `{routing_queue}`");
        });

        lock_ignore_poison(&self.consumers).push(handle);

        Ok(DeliveryStream { inbox: rx })
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handles: Vec<_> = lock_ignore_poison(&self.consumers).drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        self.connection
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| transport_err("connection close failed", e))?;

        log_info!("[{}] AMQP channel closed", self.channel_id);
        Ok(())
    }
}

/// Dial an AMQP broker and open one channel on the new connection.
///
/// # Errors
///
/// Returns [`RpcError::Transport`] if the connection or the channel cannot
/// be established. A connection whose channel cannot be opened is closed
/// before returning.
pub async fn connect_lapin_channel(uri: &str, channel_id: impl Into<String>) -> Result<ChannelPtr> {
    // ---
    let channel_id = channel_id.into();

    log_info!("[{channel_id}] connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let err = transport_err("connection failed", e);
            log_error!("[{channel_id}] {err}");
            err
        })?;

    let channel = match connection.create_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            let err = transport_err("channel creation failed", e);
            log_error!("[{channel_id}] {err}");
            let _ = connection.close(200, "Channel setup failed".into()).await;
            return Err(err);
        }
    };

    log_info!("[{channel_id}] AMQP channel open");

    Ok(Arc::new(LapinChannel {
        channel_id,
        connection,
        channel,
        consumers: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
    }))
}
