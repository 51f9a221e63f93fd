// src/client/mod.rs
//! RPC client implementation.
//!
//! This module contains the [`RpcClient`] type, which publishes calls to a
//! service queue and routes replies back to the callers that issued them.
//!
//! # Architecture
//!
//! Each client owns one broker channel and one exclusive reply queue on it,
//! and runs a background dispatch loop consuming that queue. Every call that
//! expects a reply gets a fresh correlation id from the client's generator
//! and an entry in the client's correlation registry. The request carries
//! the id and the reply queue name; the remote side echoes the id on its
//! reply, and the dispatch loop uses it to find the waiting call.
//!
//! # Concurrency
//!
//! Any number of calls can be in flight. The registry is one mutex-guarded
//! map; the entry is inserted before the request is published so even an
//! immediate reply finds it.
//!
//! # Caller responsibility
//!
//! A [`PendingCall`] that is never read and never disposed keeps its entry
//! until it is dropped. Calls still open when the client is closed are never
//! fulfilled; bound waits with [`PendingCall::recv_timeout`] or a timer.

mod dispatch;
mod pending;
mod registry;

pub use pending::{Disposer, PendingCall};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::protocol::RequestBody;
use crate::{
    // ---
    log_debug,
    log_info,
    ChannelPtr,
    CorrelationIdGenerator,
    MessageProperties,
    Publishing,
    QueueName,
    QueueOptions,
    Result,
};

use pending::PendingSlot;
use registry::CorrelationRegistry;

/// Settings a client is built with. See [`RpcClientBuilder`](crate::RpcClientBuilder).
#[derive(Debug, Clone)]
pub(crate) struct ClientSettings {
    pub service_name: QueueName,
    pub default_ttl: Duration,
    pub request_timeout: Duration,
    pub content_type: Arc<str>,
    pub reply_queue_name: Option<String>,
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed); clones share the channel, the
/// reply queue and the dispatch loop.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    channel: ChannelPtr,
    settings: ClientSettings,
    reply_queue: QueueName,
    registry: Arc<CorrelationRegistry>,
    ids: CorrelationIdGenerator,
    dispatch_task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}

impl RpcClient {
    // ---

    /// Declare the reply queue, start consuming it, and spawn the dispatch
    /// loop. On failure the channel is closed before the error is returned.
    pub(crate) async fn start(channel: ChannelPtr, settings: ClientSettings) -> Result<Self> {
        // ---
        match Self::setup(&channel, settings).await {
            Ok(client) => Ok(client),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    async fn setup(channel: &ChannelPtr, settings: ClientSettings) -> Result<Self> {
        // ---
        let reply_queue = channel
            .declare_queue(QueueOptions::reply(settings.reply_queue_name.clone()))
            .await?;

        let stream = channel.consume(&reply_queue).await?;

        let registry = Arc::new(CorrelationRegistry::new());
        let dispatch_task = dispatch::spawn_dispatch_loop(
            channel.channel_id().to_string(),
            Arc::clone(&registry),
            stream,
        );

        log_info!(
            "[{}] rpc client ready: service `{}`, reply queue `{reply_queue}`",
            channel.channel_id(),
            settings.service_name
        );

        Ok(Self {
            inner: Arc::new(Inner {
                channel: Arc::clone(channel),
                settings,
                reply_queue,
                registry,
                ids: CorrelationIdGenerator::new(),
                dispatch_task,
            }),
        })
    }

    /// Call `method` on the service and return a handle to await the reply.
    ///
    /// `args` is any value that serializes as an ordered sequence: a tuple,
    /// array or `Vec`; `()` for no arguments. The request expires on the
    /// broker after the client's default TTL.
    ///
    /// # Errors
    ///
    /// - `RpcError::Serialization` / `RpcError::InvalidArguments` before
    ///   anything is published
    /// - `RpcError::Transport` / `RpcError::ChannelClosed` if publishing
    ///   fails; no registry entry is left behind
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(client: mom_rpc_client::RpcClient) -> mom_rpc_client::Result<()> {
    /// let mut call = client.call("add", (2, 3)).await?;
    /// let reply = call.recv().await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<A>(&self, method: &str, args: A) -> Result<PendingCall>
    where
        A: Serialize,
    {
        self.call_with_ttl(method, args, self.inner.settings.default_ttl)
            .await
    }

    /// [`call`](Self::call) with an explicit broker-side expiration.
    pub async fn call_with_ttl<A>(&self, method: &str, args: A, ttl: Duration) -> Result<PendingCall>
    where
        A: Serialize,
    {
        // ---
        let body = Bytes::from(RequestBody::new(method, args)?.to_bytes()?);

        let id = self.inner.ids.next_id();
        let (slot, output) = PendingSlot::new();
        self.inner.registry.register(id.clone(), Arc::clone(&slot))?;

        // From here on the handle owns the registry entry: dropping it on the
        // error path below deregisters the call.
        let call = PendingCall::new(id.clone(), slot, output, &self.inner.registry);

        let properties = MessageProperties::default()
            .with_content_type(Arc::clone(&self.inner.settings.content_type))
            .with_correlation_id(id.clone())
            .with_reply_to(self.inner.reply_queue.clone())
            .with_expiration(ttl);

        self.inner
            .channel
            .publish(Publishing::to_queue(
                self.inner.settings.service_name.clone(),
                body,
                properties,
            ))
            .await?;

        log_debug!(
            "[{}] published `{method}` to `{}`, expecting reply on `{}` for {id}",
            self.inner.channel.channel_id(),
            self.inner.settings.service_name,
            self.inner.reply_queue
        );

        Ok(call)
    }

    /// Call `method` without expecting a reply.
    ///
    /// The request carries no correlation id, no reply-to and no expiration,
    /// and nothing is registered. Returns once the publish completes.
    pub async fn call_void<A>(&self, method: &str, args: A) -> Result<()>
    where
        A: Serialize,
    {
        // ---
        let body = Bytes::from(RequestBody::new(method, args)?.to_bytes()?);

        let properties =
            MessageProperties::default().with_content_type(Arc::clone(&self.inner.settings.content_type));

        self.inner
            .channel
            .publish(Publishing::to_queue(
                self.inner.settings.service_name.clone(),
                body,
                properties,
            ))
            .await?;

        log_debug!(
            "[{}] published `{method}` to `{}` (no reply expected)",
            self.inner.channel.channel_id(),
            self.inner.settings.service_name
        );

        Ok(())
    }

    /// Call `method`, wait up to the configured request timeout, and decode
    /// the JSON reply into `R`.
    ///
    /// # Errors
    ///
    /// Everything [`call`](Self::call) returns, plus `RpcError::Timeout` when
    /// no reply arrives in time (the call is disposed) and
    /// `RpcError::Serialization` if the reply does not decode.
    pub async fn request<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        // ---
        let mut call = self.call(method, args).await?;
        let reply = call.recv_timeout(self.inner.settings.request_timeout).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Close the broker channel.
    ///
    /// The dispatch loop sees its delivery stream end and exits. Calls still
    /// pending are never fulfilled; their readers wait until they dispose.
    pub async fn close(&self) -> Result<()> {
        // ---
        log_info!(
            "[{}] closing rpc client ({} calls pending)",
            self.inner.channel.channel_id(),
            self.inner.registry.len()
        );
        self.inner.channel.close().await
    }

    /// Number of calls currently registered and awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Name of this client's reply queue.
    pub fn reply_queue(&self) -> &QueueName {
        &self.inner.reply_queue
    }

    /// Routing key requests are published with.
    pub fn service_name(&self) -> &QueueName {
        &self.inner.settings.service_name
    }

    /// Broker-side expiration applied by [`call`](Self::call).
    pub fn default_ttl(&self) -> Duration {
        self.inner.settings.default_ttl
    }

    /// Whether the dispatch loop has exited.
    pub fn is_dispatch_finished(&self) -> bool {
        self.inner.dispatch_task.is_finished()
    }
}
