//! Message definitions
//!
//! `Message` is a closed sum type; each variant has a stable wire tag carried
//! in the `$type` field. Decoding an unknown tag fails, it never yields a
//! partially populated variant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Header name to ordered list of values. Value order is significant,
/// name order is not.
pub type Headers = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "camelCase")]
pub enum Message {
    Hello(HelloMessage),
    Greeting(GreetingMessage),
    Subscribe(SubscribeMessage),
    Unsubscribe(UnsubscribeMessage),
    Publish(PublishMessage),
    Deliver(DeliverMessage),
    Acknowledge(AcknowledgeMessage),
    Reject(RejectMessage),
}

impl Message {
    /// The wire tag of this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Greeting(_) => "greeting",
            Message::Subscribe(_) => "subscribe",
            Message::Unsubscribe(_) => "unsubscribe",
            Message::Publish(_) => "publish",
            Message::Deliver(_) => "deliver",
            Message::Acknowledge(_) => "acknowledge",
            Message::Reject(_) => "reject",
        }
    }
}

/// Opens the handshake. Capabilities are reserved for future negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GreetingMessage {
    pub id: Uuid,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub informational_version: Option<String>,
}

impl GreetingMessage {
    /// A greeting for this server build with a fresh id.
    pub fn create() -> Self {
        Self {
            id: Uuid::new_v4(),
            version: super::PROTOCOL_VERSION.to_string(),
            informational_version: Some(super::BUILD_LABEL.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeMessage {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeMessage {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessage {
    pub id: Uuid,
    pub topic: String,
    #[serde(default)]
    pub headers: Headers,
    pub payload: Value,
}

/// One fan-out instance of a publish, addressed to a single subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverMessage {
    pub id: Uuid,
    pub topic: String,
    #[serde(default)]
    pub headers: Headers,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl DeliverMessage {
    /// Builds a delivery of `publish` with a fresh delivery id.
    pub fn from_publish(publish: &PublishMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: publish.topic.clone(),
            headers: publish.headers.clone(),
            payload: publish.payload.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeMessage {
    pub id: Uuid,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectMessage {
    pub id: Uuid,
    pub topic: String,
}
