//! Envelopes
//!
//! Every frame on the wire is one envelope. The `$type` discriminator names
//! the direction (`client` or `server`) so a decoder never has to guess.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "camelCase")]
pub enum Envelope {
    Server(ServerEnvelope),
    Client(ClientEnvelope),
}

/// Envelope originated by the broker. Always carries a send timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    pub id: Uuid,
    pub message: Message,
    pub timestamp: DateTime<Utc>,
}

impl ServerEnvelope {
    pub fn for_message(message: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Envelope originated by a client. The id is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub message: Message,
}

impl ClientEnvelope {
    pub fn for_message(message: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
        }
    }
}

impl From<ServerEnvelope> for Envelope {
    fn from(envelope: ServerEnvelope) -> Self {
        Envelope::Server(envelope)
    }
}

impl From<ClientEnvelope> for Envelope {
    fn from(envelope: ClientEnvelope) -> Self {
        Envelope::Client(envelope)
    }
}
