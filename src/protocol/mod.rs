//! Request wire format.
//!
//! Requests are published as JSON `{"method": "<name>", "args": [...]}`.
//! Replies are opaque bytes and are not modelled here.
mod message;

pub use message::{RequestBody, CONTENT_TYPE_JSON};
