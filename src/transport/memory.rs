//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`BrokerChannel`] trait. It is intended primarily for testing, local
//! execution, and as a reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker models the subset of AMQP 0-9-1 the RPC client relies
//! on:
//!
//! - Only the default exchange (`""`) exists; the routing key names the
//!   destination queue. Publishing to a queue that does not exist drops the
//!   message silently.
//! - Declaring a queue with an empty name yields a broker-assigned
//!   `amq.gen-…` name.
//! - Exclusive queues belong to the declaring channel; auto-delete queues
//!   disappear when their owner closes or their consumer goes away.
//! - Each queue has at most one consumer. Messages published while a queue
//!   has no consumer are buffered and handed over, in order, when a consumer
//!   attaches. Buffered messages whose `expiration` has elapsed by then are
//!   discarded.
//! - Deliveries carry a hub-wide delivery tag; acks are counted.
//!
//! ## Non-Goals
//!
//! Persistence, redelivery of unacked messages, prefetch limits, and
//! non-default exchanges are not modelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Instant;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    // ---
    log_debug,
    log_trace,
    Acknowledger,
    BrokerChannel,
    ChannelPtr,
    Delivery,
    DeliveryStream,
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

struct Buffered {
    msg: Publishing,
    enqueued_at: Instant,
}

impl Buffered {
    fn is_expired(&self) -> bool {
        match self.msg.properties.expiration {
            Some(ttl) => self.enqueued_at.elapsed() >= ttl,
            None => false,
        }
    }
}

struct Consumer {
    channel_id: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    /// Owning channel for exclusive queues.
    owner: Option<String>,
    auto_delete: bool,
    consumer: Option<Consumer>,
    backlog: VecDeque<Buffered>,
}

/// Shared message bus for the in-memory broker.
///
/// Simulates a broker within a single process. All [`MemoryChannel`]s that
/// share a hub see the same queues, exactly as channels connected to the same
/// broker would.
///
/// Construct a hub per test for isolation between parallel test cases:
///
/// ```
/// # use mom_rpc_client::{MemoryHub, create_memory_channel_with_hub};
/// let hub = MemoryHub::new();
/// let client_channel = create_memory_channel_with_hub("client", hub.clone());
/// let service_channel = create_memory_channel_with_hub("math-service", hub.clone());
/// ```
pub struct MemoryHub {
    // ---
    queues: Mutex<HashMap<QueueName, QueueState>>,
    next_tag: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    expired: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Total deliveries handed to consumers.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Total deliveries acknowledged by consumers.
    pub fn acked_count(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    /// Buffered messages discarded because their expiration elapsed.
    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::SeqCst)
    }

    /// Whether a queue with this name currently exists.
    pub fn queue_exists(&self, name: &str) -> bool {
        // ---
        let queues = lock_ignore_poison(&self.queues);
        queues.contains_key(&QueueName::from(name))
    }

    /// Messages buffered on a queue awaiting a consumer.
    pub fn queue_depth(&self, name: &str) -> usize {
        // ---
        let queues = lock_ignore_poison(&self.queues);
        queues
            .get(&QueueName::from(name))
            .map_or(0, |q| q.backlog.len())
    }

    fn make_delivery(self: &Arc<Self>, msg: Publishing) -> Delivery {
        // ---
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        Delivery {
            delivery_tag,
            routing_key: msg.routing_key,
            body: msg.body,
            properties: msg.properties,
            acker: Arc::new(MemoryAcker {
                hub: Arc::downgrade(self),
            }),
        }
    }

    fn route(self: &Arc<Self>, _channel_id: &str, msg: Publishing) -> Result<()> {
        // ---
        if !msg.exchange.is_empty() {
            let msg = format!("memory: unknown exchange `{}`", msg.exchange);
            return Err(RpcError::Transport(msg));
        }

        let mut queues = lock_ignore_poison(&self.queues);

        let Some(queue) = queues.get_mut(&msg.routing_key) else {
            log_debug!(
                "{_channel_id}: no queue `{}`, message dropped",
                msg.routing_key
            );
            return Ok(());
        };

        let Some(consumer) = queue.consumer.as_ref() else {
            log_trace!("{_channel_id}: buffered on `{}`", msg.routing_key);
            queue.backlog.push_back(Buffered {
                msg,
                enqueued_at: Instant::now(),
            });
            return Ok(());
        };

        let delivery = self.make_delivery(msg);
        match consumer.tx.send(delivery) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::SendError(delivery)) => {
                // Consumer went away without closing its channel; keep the
                // message for the next consumer.
                queue.consumer = None;
                queue.backlog.push_back(Buffered {
                    msg: Publishing::to_queue(
                        delivery.routing_key,
                        delivery.body,
                        delivery.properties,
                    ),
                    enqueued_at: Instant::now(),
                });
            }
        }

        Ok(())
    }

    fn declare(&self, channel_id: &str, opts: QueueOptions) -> Result<QueueName> {
        // ---
        let name = if opts.name.is_empty() {
            QueueName::from(format!("amq.gen-{}", Uuid::new_v4().simple()))
        } else {
            QueueName::from(opts.name)
        };

        let mut queues = lock_ignore_poison(&self.queues);

        if let Some(existing) = queues.get(&name) {
            return match existing.owner.as_deref() {
                Some(owner) if owner != channel_id => {
                    let msg = format!("memory: queue `{name}` is exclusive to `{owner}`");
                    Err(RpcError::Transport(msg))
                }
                _ => Ok(name),
            };
        }

        queues.insert(
            name.clone(),
            QueueState {
                owner: opts.exclusive.then(|| channel_id.to_string()),
                auto_delete: opts.auto_delete,
                consumer: None,
                backlog: VecDeque::new(),
            },
        );

        log_debug!("{channel_id}: declared queue `{name}`");
        Ok(name)
    }

    fn consume(self: &Arc<Self>, channel_id: &str, queue: &QueueName) -> Result<DeliveryStream> {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);

        let Some(state) = queues.get_mut(queue) else {
            let msg = format!("memory: no queue `{queue}`");
            return Err(RpcError::Transport(msg));
        };

        if let Some(owner) = state.owner.as_deref() {
            if owner != channel_id {
                let msg = format!("memory: queue `{queue}` is exclusive to `{owner}`");
                return Err(RpcError::Transport(msg));
            }
        }

        if state.consumer.as_ref().is_some_and(|c| !c.tx.is_closed()) {
            let msg = format!("memory: queue `{queue}` already has a consumer");
            return Err(RpcError::Transport(msg));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        // Hand over the backlog while still holding the lock so buffered
        // messages precede anything published from now on.
        while let Some(buffered) = state.backlog.pop_front() {
            if buffered.is_expired() {
                self.expired.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            let delivery = self.make_delivery(buffered.msg);
            if tx.send(delivery).is_ok() {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }

        state.consumer = Some(Consumer {
            channel_id: channel_id.to_string(),
            tx,
        });

        log_debug!("{channel_id}: consuming `{queue}`");
        Ok(DeliveryStream { inbox: rx })
    }

    fn close_channel(&self, channel_id: &str) {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);

        queues.retain(|_name, state| {
            if state.owner.as_deref() == Some(channel_id) {
                log_debug!("{channel_id}: deleting exclusive queue `{_name}`");
                return false;
            }

            let consumed_here = state
                .consumer
                .as_ref()
                .is_some_and(|c| c.channel_id == channel_id);

            if consumed_here {
                // Dropping the sender ends the consumer's delivery stream.
                state.consumer = None;
                if state.auto_delete {
                    log_debug!("{channel_id}: auto-deleting queue `{_name}`");
                    return false;
                }
            }

            true
        });
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }
}

struct MemoryAcker {
    hub: Weak<MemoryHub>,
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        // ---
        let hub = self.hub.upgrade().ok_or(RpcError::ChannelClosed)?;
        hub.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Process-global hub used by [`create_memory_channel`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory broker channel.
///
/// Routes messages through a shared [`MemoryHub`]. Closing the channel
/// deletes the exclusive queues it declared and ends the delivery streams of
/// the consumers it started.
pub struct MemoryChannel {
    // ---
    channel_id: String,
    hub: Arc<MemoryHub>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    // ---
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn publish(&self, msg: Publishing) -> Result<()> {
        self.ensure_open()?;
        self.hub.route(&self.channel_id, msg)
    }

    async fn declare_queue(&self, opts: QueueOptions) -> Result<QueueName> {
        self.ensure_open()?;
        self.hub.declare(&self.channel_id, opts)
    }

    async fn consume(&self, queue: &QueueName) -> Result<DeliveryStream> {
        self.ensure_open()?;
        self.hub.consume(&self.channel_id, queue)
    }

    /// Close the channel. Idempotent.
    async fn close(&self) -> Result<()> {
        // ---
        if !self.closed.swap(true, Ordering::SeqCst) {
            log_debug!("{}: closing memory channel", self.channel_id);
            self.hub.close_channel(&self.channel_id);
        }
        Ok(())
    }
}

/// Open a channel on the process-global hub.
///
/// All channels created with this function share one message bus. For
/// isolated parallel testing, use [`create_memory_channel_with_hub`].
pub fn create_memory_channel(channel_id: impl Into<String>) -> ChannelPtr {
    // ---
    create_memory_channel_with_hub(channel_id, global_hub())
}

/// Open a channel on the provided hub.
pub fn create_memory_channel_with_hub(
    channel_id: impl Into<String>,
    hub: Arc<MemoryHub>,
) -> ChannelPtr {
    // ---
    let channel_id = channel_id.into();
    log_debug!("{channel_id}: create memory channel");

    Arc::new(MemoryChannel {
        channel_id,
        hub,
        closed: AtomicBool::new(false),
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::MessageProperties;
    use bytes::Bytes;
    use std::time::Duration;

    fn publishing(queue: &str, body: &'static [u8]) -> Publishing {
        Publishing::to_queue(
            QueueName::from(queue),
            Bytes::from_static(body),
            MessageProperties::default(),
        )
    }

    #[tokio::test]
    async fn test_server_named_queue_is_unique() {
        // ---
        let hub = MemoryHub::new();
        let ch = create_memory_channel_with_hub("c", hub.clone());

        let q1 = ch.declare_queue(QueueOptions::reply(None)).await.unwrap();
        let q2 = ch.declare_queue(QueueOptions::reply(None)).await.unwrap();

        assert!(q1.as_str().starts_with("amq.gen-"));
        assert_ne!(q1, q2);
        assert!(hub.queue_exists(q1.as_str()));
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_is_dropped() {
        // ---
        let hub = MemoryHub::new();
        let ch = create_memory_channel_with_hub("c", hub.clone());

        ch.publish(publishing("nowhere", b"x")).await.unwrap();
        assert_eq!(hub.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_backlog_handed_to_late_consumer_in_order() {
        // ---
        let hub = MemoryHub::new();
        let ch = create_memory_channel_with_hub("svc", hub.clone());
        let q = ch.declare_queue(QueueOptions::named("svc")).await.unwrap();

        ch.publish(publishing("svc", b"1")).await.unwrap();
        ch.publish(publishing("svc", b"2")).await.unwrap();
        assert_eq!(hub.queue_depth("svc"), 2);

        let mut stream = ch.consume(&q).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().body, Bytes::from_static(b"1"));
        assert_eq!(stream.recv().await.unwrap().body, Bytes::from_static(b"2"));
        assert_eq!(hub.queue_depth("svc"), 0);
    }

    #[tokio::test]
    async fn test_expired_backlog_is_discarded() {
        // ---
        let hub = MemoryHub::new();
        let ch = create_memory_channel_with_hub("svc", hub.clone());
        let q = ch.declare_queue(QueueOptions::named("svc")).await.unwrap();

        let mut msg = publishing("svc", b"stale");
        msg.properties.expiration = Some(Duration::from_millis(10));
        ch.publish(msg).await.unwrap();
        ch.publish(publishing("svc", b"fresh")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut stream = ch.consume(&q).await.unwrap();
        let d = stream.recv().await.unwrap();
        assert_eq!(d.body, Bytes::from_static(b"fresh"));
        assert_eq!(hub.expired_count(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_queue_rejects_foreign_consumer() {
        // ---
        let hub = MemoryHub::new();
        let owner = create_memory_channel_with_hub("owner", hub.clone());
        let other = create_memory_channel_with_hub("other", hub.clone());

        let q = owner.declare_queue(QueueOptions::reply(None)).await.unwrap();
        let err = other.consume(&q).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_deletes_exclusive_queue() {
        // ---
        let hub = MemoryHub::new();
        let ch = create_memory_channel_with_hub("c", hub.clone());
        let q = ch.declare_queue(QueueOptions::reply(None)).await.unwrap();
        let mut stream = ch.consume(&q).await.unwrap();

        ch.close().await.unwrap();
        ch.close().await.unwrap();

        assert!(stream.recv().await.is_none());
        assert!(!hub.queue_exists(q.as_str()));

        let err = ch.publish(publishing("x", b"x")).await.unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_acks_are_counted() {
        // ---
        let hub = MemoryHub::new();
        let ch = create_memory_channel_with_hub("svc", hub.clone());
        let q = ch.declare_queue(QueueOptions::named("svc")).await.unwrap();
        let mut stream = ch.consume(&q).await.unwrap();

        ch.publish(publishing("svc", b"a")).await.unwrap();
        let d = stream.recv().await.unwrap();
        assert_eq!(hub.delivered_count(), 1);
        assert_eq!(hub.acked_count(), 0);

        d.ack().await.unwrap();
        assert_eq!(hub.acked_count(), 1);
    }
}
