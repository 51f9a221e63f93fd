// tests/common/mod.rs
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use mom_rpc_client::{
    // ---
    create_memory_channel_with_hub,
    BrokerChannel,
    ChannelPtr,
    DeliveryStream,
    MemoryHub,
    MessageProperties,
    Publishing,
    QueueOptions,
    RequestBody,
};

static INIT: Once = Once::new();

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_logging() {
    // ---
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Declare `queue` on a fresh channel and consume it, without replying.
///
/// Lets a test inspect exactly what the client published.
pub async fn observe_queue(hub: &Arc<MemoryHub>, queue: &str) -> (ChannelPtr, DeliveryStream) {
    // ---
    let channel = create_memory_channel_with_hub(format!("{queue}-observer"), hub.clone());
    let name = channel
        .declare_queue(QueueOptions::named(queue))
        .await
        .expect("declare service queue");
    let stream = channel.consume(&name).await.expect("consume service queue");
    (channel, stream)
}

/// A stand-in remote service on `queue` that answers `add` with the sum of
/// its integer arguments and ignores everything else.
pub async fn spawn_math_service(hub: &Arc<MemoryHub>, queue: &str) -> (ChannelPtr, JoinHandle<()>) {
    // ---
    let (channel, mut stream) = observe_queue(hub, queue).await;
    let replies = channel.clone();

    let handle = tokio::spawn(async move {
        while let Some(delivery) = stream.recv().await {
            delivery.ack().await.expect("ack");

            let Ok(req) = serde_json::from_slice::<RequestBody>(&delivery.body) else {
                continue;
            };
            if req.method != "add" {
                continue;
            }
            let sum: i64 = req.args.iter().filter_map(|v| v.as_i64()).sum();

            let (Some(reply_to), Some(id)) = (
                delivery.properties.reply_to.clone(),
                delivery.properties.correlation_id.clone(),
            ) else {
                continue;
            };

            let props = MessageProperties::default()
                .with_content_type("application/json")
                .with_correlation_id(id);
            let body = Bytes::from(sum.to_string());

            if replies
                .publish(Publishing::to_queue(reply_to, body, props))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    (channel, handle)
}

/// Poll `cond` until it holds, panicking after one second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    // ---
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 1s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
