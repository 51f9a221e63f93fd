//! RPC client builder.
//!
//! Provides a fluent builder API for configuring [`RpcClient`] instances:
//! the target service, request expiration, reply timeout, and reply queue.

use std::sync::Arc;
use std::time::Duration;

use crate::client::ClientSettings;
use crate::protocol::CONTENT_TYPE_JSON;
use crate::{ChannelPtr, QueueName, Result, RpcClient, RpcError};

/// Default broker-side request expiration.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Default bound used by [`RpcClient::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for creating RPC client instances.
///
/// Accepts the broker channel the client will own. Only the service name is
/// required.
///
/// # Examples
///
/// ```no_run
/// use mom_rpc_client::{create_memory_channel, RpcClientBuilder};
/// use std::time::Duration;
///
/// # async fn example() -> mom_rpc_client::Result<()> {
/// let client = RpcClientBuilder::new(create_memory_channel("math-client"))
///     .service_name("math")
///     .default_ttl(Duration::from_secs(5))
///     .request_timeout(Duration::from_secs(2))
///     .build()
///     .await?;
///
/// let sum: i64 = client.request("add", (2, 3)).await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcClientBuilder {
    // ---
    channel: ChannelPtr,
    service_name: Option<String>,
    default_ttl: Option<Duration>,
    request_timeout: Option<Duration>,
    content_type: Option<String>,
    reply_queue_name: Option<String>,
}

impl RpcClientBuilder {
    /// Create a new client builder on `channel`.
    pub fn new(channel: ChannelPtr) -> Self {
        // ---
        Self {
            channel,
            service_name: None,
            default_ttl: None,
            request_timeout: None,
            content_type: None,
            reply_queue_name: None,
        }
    }

    /// Set the service (queue / routing key) requests are published to.
    ///
    /// Required.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Set the broker-side expiration for requests expecting a reply.
    ///
    /// Sent as whole milliseconds. Default: 30s.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set how long [`RpcClient::request`] waits for a reply.
    ///
    /// Default: 30s.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Override the content type published with every request.
    ///
    /// Default: `application/json`.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Use a fixed reply queue name instead of a broker-assigned one.
    ///
    /// The queue is still declared exclusive and auto-delete.
    pub fn reply_queue_name(mut self, name: impl Into<String>) -> Self {
        self.reply_queue_name = Some(name.into());
        self
    }

    /// Build the client (consumes self).
    ///
    /// # Errors
    ///
    /// - `RpcError::InvalidConfig` if the service name is missing or empty,
    ///   or a timeout is zero
    /// - `RpcError::Transport` if the reply queue cannot be declared or
    ///   consumed; the channel is closed in that case
    pub async fn build(self) -> Result<RpcClient> {
        // ---
        let service_name = match self.service_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => {
                return Err(RpcError::InvalidConfig(
                    "service_name is required".to_string(),
                ))
            }
        };

        let default_ttl = self.default_ttl.unwrap_or(DEFAULT_TTL);
        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        if request_timeout.is_zero() {
            return Err(RpcError::InvalidConfig(
                "request_timeout must be greater than zero".to_string(),
            ));
        }

        let settings = ClientSettings {
            service_name: QueueName::from(service_name),
            default_ttl,
            request_timeout,
            content_type: Arc::from(self.content_type.as_deref().unwrap_or(CONTENT_TYPE_JSON)),
            reply_queue_name: self.reply_queue_name,
        };

        RpcClient::start(self.channel, settings).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_channel_with_hub, BrokerChannel, MemoryHub};

    #[tokio::test]
    async fn test_missing_service_name_rejected() {
        // ---
        let hub = MemoryHub::new();
        let result = RpcClientBuilder::new(create_memory_channel_with_hub("c", hub))
            .build()
            .await;
        assert!(matches!(result, Err(RpcError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_zero_request_timeout_rejected() {
        // ---
        let hub = MemoryHub::new();
        let result = RpcClientBuilder::new(create_memory_channel_with_hub("c", hub))
            .service_name("math")
            .request_timeout(Duration::ZERO)
            .build()
            .await;
        assert!(matches!(result, Err(RpcError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_defaults_applied() {
        // ---
        let hub = MemoryHub::new();
        let client = RpcClientBuilder::new(create_memory_channel_with_hub("c", hub.clone()))
            .service_name("math")
            .build()
            .await
            .unwrap();

        assert_eq!(client.service_name().as_str(), "math");
        assert_eq!(client.default_ttl(), DEFAULT_TTL);
        assert!(client.reply_queue().as_str().starts_with("amq.gen-"));
        assert!(hub.queue_exists(client.reply_queue().as_str()));
    }

    #[tokio::test]
    async fn test_fixed_reply_queue_name() {
        // ---
        let hub = MemoryHub::new();
        let client = RpcClientBuilder::new(create_memory_channel_with_hub("c", hub.clone()))
            .service_name("math")
            .reply_queue_name("replies/c")
            .build()
            .await
            .unwrap();

        assert_eq!(client.reply_queue().as_str(), "replies/c");
    }

    #[tokio::test]
    async fn test_failed_setup_closes_channel() {
        // ---
        let hub = MemoryHub::new();
        let owner = create_memory_channel_with_hub("owner", hub.clone());
        owner
            .declare_queue(crate::QueueOptions::reply(Some("taken".into())))
            .await
            .unwrap();

        let channel = create_memory_channel_with_hub("c", hub.clone());
        let result = RpcClientBuilder::new(channel.clone())
            .service_name("math")
            .reply_queue_name("taken")
            .build()
            .await;

        assert!(matches!(result, Err(RpcError::Transport(_))));
        let err = channel
            .declare_queue(crate::QueueOptions::named("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed));
    }
}
