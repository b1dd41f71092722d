//! The `client` module defines how the broker sees a connected client.
//!
//! The broker never owns a connection: it holds a [`MessageClient`], a
//! lookup key plus a send capability. Socket connections implement it in the
//! transport layer; [`ChannelClient`] implements it over a bounded channel
//! for in-process consumers.

pub mod pubsub_client;
pub use pubsub_client::{ChannelClient, ClientId, MessageClient};
