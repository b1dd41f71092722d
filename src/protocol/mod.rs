//! The `protocol` module defines the wire vocabulary spoken on every
//! connection: the closed set of [`Message`] variants, the direction-tagged
//! [`Envelope`] that carries them, and the JSON codec used by the transport.

pub mod codec;
pub mod envelope;
pub mod message;

pub use envelope::{ClientEnvelope, Envelope, ServerEnvelope};
pub use message::{
    AcknowledgeMessage, DeliverMessage, GreetingMessage, Headers, HelloMessage, Message,
    PublishMessage, RejectMessage, SubscribeMessage, UnsubscribeMessage,
};

/// Protocol version announced in every greeting.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Build label announced in every greeting.
pub const BUILD_LABEL: &str = concat!("tidemq ", env!("CARGO_PKG_VERSION"));

/// Default upper bound for a single inbound message.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
