//! The `error` module defines the error types shared across `tidemq`.
//!
//! Every per-connection failure ends up as a [`FatalError`]: it is the only
//! error that decides how a socket gets closed (status code + reason).
//! Broker-level conditions that must terminate a connection are expressed as
//! [`BrokerError`] and converted at the connection boundary.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// An error that terminates a connection with a specific close status.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct FatalError {
    close_code: CloseCode,
    reason: String,
    #[source]
    source: Option<BoxError>,
}

impl FatalError {
    pub fn new(close_code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            close_code,
            reason: reason.into(),
            source: None,
        }
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// A frame arrived whose type is neither text nor close.
    pub fn invalid_message_type(kind: impl fmt::Display) -> Self {
        Self::new(
            CloseCode::Protocol,
            format!("unsupported message type: {kind}"),
        )
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::Protocol, reason)
    }

    /// The inbound byte stream could not be decoded into an envelope.
    pub fn decode(err: serde_json::Error) -> Self {
        Self::new(CloseCode::Protocol, format!("invalid message: {err}")).with_source(err)
    }

    pub fn message_too_big(limit: usize) -> Self {
        Self::new(
            CloseCode::Size,
            format!("message exceeds the maximum size of {limit} bytes"),
        )
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::Error, reason)
    }

    /// Wraps any non-fatal error so it can terminate the connection.
    pub fn unhandled<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::internal("an unhandled error occurred").with_source(err)
    }

    pub fn close_code(&self) -> CloseCode {
        self.close_code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Status and reason sent to the peer in the close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseReason {
    /// Close frame payloads are limited to 125 bytes, two of which hold the code.
    pub const MAX_REASON_LEN: usize = 123;

    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::Protocol, reason)
    }

    /// The reason cut down to what fits in a close frame.
    pub fn wire_reason(&self) -> &str {
        if self.reason.len() <= Self::MAX_REASON_LEN {
            return &self.reason;
        }
        let mut end = Self::MAX_REASON_LEN;
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }
        &self.reason[..end]
    }
}

impl From<FatalError> for CloseReason {
    fn from(err: FatalError) -> Self {
        Self::new(err.close_code, err.reason)
    }
}

impl From<&FatalError> for CloseReason {
    fn from(err: &FatalError) -> Self {
        Self::new(err.close_code, err.reason.clone())
    }
}

/// Broker conditions that end the offending connection.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("client not registered: {0}")]
    ClientNotRegistered(Uuid),
}

impl From<BrokerError> for FatalError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ClientNotRegistered(_) => {
                FatalError::protocol("client not registered").with_source(err)
            }
        }
    }
}
