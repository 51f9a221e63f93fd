//! Reply dispatch loop.
//!
//! One loop runs per client, draining the reply-queue delivery stream one
//! delivery at a time:
//!
//! 1. ack the delivery so the broker does not redeliver it,
//! 2. read its correlation id,
//! 3. look the id up in the registry and push the payload into the matching
//!    pending call, removing the entry,
//! 4. otherwise drop the delivery.
//!
//! Unmatched replies are expected: a caller may dispose a call while its
//! reply is in flight. Nothing that happens to a single delivery stops the
//! loop; it ends only when the delivery stream ends.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::pending::DeliverOutcome;
use super::registry::CorrelationRegistry;
use crate::{log_debug, log_error, log_info, log_trace, log_warn, Delivery, DeliveryStream};

/// What happened to one delivery. Used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Payload handed to the waiting call.
    Delivered,
    /// The call was found but had already been closed.
    AlreadyClosed,
    /// No pending call for this id.
    Unmatched,
    /// The delivery carried no correlation id.
    MissingCorrelationId,
}

/// Route a single delivery. Acks first, whatever the outcome.
pub(crate) async fn route_delivery(
    _client_id: &str,
    registry: &CorrelationRegistry,
    delivery: Delivery,
) -> Routed {
    // ---
    if let Err(_e) = delivery.ack().await {
        log_error!(
            "[{_client_id}] failed to ack delivery {}: {_e}",
            delivery.delivery_tag
        );
    }

    let Some(id) = delivery.correlation_id() else {
        log_warn!(
            "[{_client_id}] reply on `{}` without correlation id dropped",
            delivery.routing_key
        );
        return Routed::MissingCorrelationId;
    };

    let Some(slot) = registry.lookup(id) else {
        log_debug!("[{_client_id}] no pending call for correlation id {id}, reply dropped");
        return Routed::Unmatched;
    };

    let outcome = slot.deliver(delivery.body.clone());
    registry.remove(id);

    match outcome {
        DeliverOutcome::Delivered => {
            log_trace!("[{_client_id}] reply routed to call {id}");
            Routed::Delivered
        }
        DeliverOutcome::Closed => {
            log_debug!("[{_client_id}] reply for call {id} arrived after it was closed");
            Routed::AlreadyClosed
        }
    }
}

/// Spawn the dispatch loop for one client.
pub(crate) fn spawn_dispatch_loop(
    client_id: String,
    registry: Arc<CorrelationRegistry>,
    mut stream: DeliveryStream,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        log_debug!("[{client_id}] dispatch loop started");

        while let Some(delivery) = stream.recv().await {
            route_delivery(&client_id, &registry, delivery).await;
        }

        log_info!(
            "[{client_id}] delivery stream closed, dispatch loop exiting ({} calls still pending)",
            registry.len()
        );
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::client::pending::PendingSlot;
    use crate::{Acknowledger, CorrelationId, MessageProperties, QueueName, Result};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingAcker {
        acked: AtomicU64,
    }

    #[async_trait::async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self, _delivery_tag: u64) -> Result<()> {
            self.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn delivery(acker: &Arc<CountingAcker>, id: Option<&str>, body: &'static [u8]) -> Delivery {
        // ---
        let mut properties = MessageProperties::default();
        properties.correlation_id = id.map(CorrelationId::from);
        Delivery {
            delivery_tag: 1,
            routing_key: QueueName::from("amq.gen-test"),
            body: Bytes::from_static(body),
            properties,
            acker: Arc::clone(acker) as Arc<dyn Acknowledger>,
        }
    }

    #[tokio::test]
    async fn test_matched_delivery_is_routed_and_deregistered() {
        // ---
        let acker = Arc::new(CountingAcker::default());
        let registry = CorrelationRegistry::new();
        let (slot, mut rx) = PendingSlot::new();
        registry.register(CorrelationId::from("1"), slot).unwrap();

        let routed = route_delivery("t", &registry, delivery(&acker, Some("1"), b"5")).await;

        assert_eq!(routed, Routed::Delivered);
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"5")));
        assert_eq!(rx.recv().await, None);
        assert_eq!(registry.len(), 0);
        assert_eq!(acker.acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_id_does_not_disturb_other_calls() {
        // ---
        let acker = Arc::new(CountingAcker::default());
        let registry = CorrelationRegistry::new();
        let (slot, mut rx) = PendingSlot::new();
        registry.register(CorrelationId::from("1"), Arc::clone(&slot)).unwrap();

        let routed = route_delivery("t", &registry, delivery(&acker, Some("99"), b"x")).await;

        assert_eq!(routed, Routed::Unmatched);
        assert_eq!(registry.len(), 1);
        assert!(!slot.is_closed());
        assert!(rx.try_recv().is_err());
        // Unmatched deliveries are acked too.
        assert_eq!(acker.acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_correlation_id_is_dropped() {
        // ---
        let acker = Arc::new(CountingAcker::default());
        let registry = CorrelationRegistry::new();

        let routed = route_delivery("t", &registry, delivery(&acker, None, b"x")).await;
        assert_eq!(routed, Routed::MissingCorrelationId);
        assert_eq!(acker.acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_reply_for_same_id_is_noop() {
        // ---
        let acker = Arc::new(CountingAcker::default());
        let registry = CorrelationRegistry::new();
        let (slot, mut rx) = PendingSlot::new();
        let id = CorrelationId::from("1");
        registry.register(id.clone(), Arc::clone(&slot)).unwrap();

        route_delivery("t", &registry, delivery(&acker, Some("1"), b"a")).await;
        // Put the entry back to simulate a duplicate arriving before removal.
        registry.register(id, slot).unwrap();
        let routed = route_delivery("t", &registry, delivery(&acker, Some("1"), b"b")).await;

        assert_eq!(routed, Routed::AlreadyClosed);
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"a")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_loop_exits_when_stream_closes() {
        // ---
        let acker = Arc::new(CountingAcker::default());
        let registry = Arc::new(CorrelationRegistry::new());
        let (slot, mut rx) = PendingSlot::new();
        registry.register(CorrelationId::from("2"), slot).unwrap();

        let (tx, inbox) = mpsc::unbounded_channel();
        let handle = spawn_dispatch_loop("t".into(), Arc::clone(&registry), DeliveryStream { inbox });

        tx.send(delivery(&acker, Some("404"), b"nobody")).unwrap();
        tx.send(delivery(&acker, Some("2"), b"ok")).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatch loop did not exit")
            .unwrap();

        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"ok")));
        assert_eq!(acker.acked.load(Ordering::SeqCst), 2);
    }
}
