//! Correlated request/response RPC over message-broker queues.
//!
//! This library is the client half of an RPC protocol carried on an
//! AMQP-style broker. Calls are published to a service queue as
//! `{"method": ..., "args": [...]}`; replies come back on a reply queue
//! owned by the client, tagged with the correlation id of the request.
//!
//! The crate handles correlation id generation, the registry of in-flight
//! calls, the dispatch loop routing replies to their callers, and the
//! disposal contract for abandoned calls. The broker itself is reached
//! through the [`BrokerChannel`] trait; an in-memory broker is always
//! available and an AMQP channel backed by `lapin` sits behind the
//! `transport_lapin` feature.
//!
//! ```no_run
//! use mom_rpc_client::{create_memory_channel, RpcClientBuilder};
//! use std::time::Duration;
//!
//! # async fn example() -> mom_rpc_client::Result<()> {
//! let client = RpcClientBuilder::new(create_memory_channel("client-1"))
//!     .service_name("math")
//!     .build()
//!     .await?;
//!
//! let mut call = client.call("add", (2, 3)).await?;
//! match call.recv_timeout(Duration::from_secs(5)).await {
//!     Ok(reply) => println!("reply: {reply:?}"),
//!     Err(err) => eprintln!("no reply: {err}"),
//! }
//!
//! client.call_void("log", ("hello",)).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

mod client;
mod client_builder;
mod domain;
mod protocol;
mod transport;

mod correlation;
mod error;

// Re-export main types
pub use client::{Disposer, PendingCall, RpcClient};
pub use client_builder::{RpcClientBuilder, DEFAULT_REQUEST_TIMEOUT, DEFAULT_TTL};

pub use correlation::{CorrelationId, CorrelationIdGenerator};
pub use error::{Result, RpcError};
pub use protocol::{RequestBody, CONTENT_TYPE_JSON};

pub use transport::{
    //
    create_memory_channel,
    create_memory_channel_with_hub,
    MemoryChannel,
    MemoryHub,
};

#[cfg(feature = "transport_lapin")]
pub use transport::{connect_lapin_channel, LapinChannel};

// --- public re-exports
pub use domain::{
    //
    AckerPtr,
    Acknowledger,
    BrokerChannel,
    ChannelPtr,
    Delivery,
    DeliveryStream,
    MessageProperties,
    Publishing,
    QueueName,
    QueueOptions,
};
