//! Domain layer public interface.
//!
//! Broker-facing abstractions that are independent of any concrete broker
//! client library. Consumers import symbols via this module, not from the
//! individual files.

mod channel;

pub use channel::{
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
