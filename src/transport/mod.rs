//! Broker channel implementations.
//!
//! Concrete implementations of the domain-level [`BrokerChannel`](crate::BrokerChannel)
//! trait. Broker-backed channels sit behind feature flags and are exposed only
//! through constructor functions.
//!
//! Domain code must not depend on implementation-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::{connect_lapin_channel, LapinChannel};

pub use memory::{
    //
    create_memory_channel,
    create_memory_channel_with_hub,
    MemoryChannel,
    MemoryHub,
};
