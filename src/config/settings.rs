use serde::Deserialize;

use crate::protocol::MAX_MESSAGE_SIZE;
use crate::transport::buffer::DEFAULT_CAPACITY;
use crate::transport::pipe::{DEFAULT_MAX_FRAME_SIZE, PipeOptions};

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub transport: TransportSettings,
    pub log: LogSettings,
}

/// The address the WebSocket listener binds to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Delivery policy of the broker.
///
/// `max_redeliveries` bounds how often one delivery is re-sent after a
/// reject or an acknowledgement timeout before it is dead-lettered.
/// `ack_timeout_ms` of zero disables expiry of unacknowledged deliveries.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_redeliveries: u32,
    pub ack_timeout_ms: u64,
    pub expiry_interval_ms: u64,
}

/// Per-connection buffering and framing limits.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TransportSettings {
    pub buffer_capacity: usize,
    pub max_frame_size: usize,
    pub max_message_size: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

impl From<&TransportSettings> for PipeOptions {
    fn from(settings: &TransportSettings) -> Self {
        PipeOptions {
            buffer_capacity: settings.buffer_capacity,
            max_frame_size: settings.max_frame_size,
            max_message_size: settings.max_message_size,
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub transport: Option<PartialTransportSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_redeliveries: Option<u32>,
    pub ack_timeout_ms: Option<u64>,
    pub expiry_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialTransportSettings {
    pub buffer_capacity: Option<usize>,
    pub max_frame_size: Option<usize>,
    pub max_message_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Overlays whatever was specified on top of `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server;
        let broker = self.broker;
        let transport = self.transport;
        let log = self.log;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                max_redeliveries: broker
                    .as_ref()
                    .and_then(|b| b.max_redeliveries)
                    .unwrap_or(default.broker.max_redeliveries),
                ack_timeout_ms: broker
                    .as_ref()
                    .and_then(|b| b.ack_timeout_ms)
                    .unwrap_or(default.broker.ack_timeout_ms),
                expiry_interval_ms: broker
                    .as_ref()
                    .and_then(|b| b.expiry_interval_ms)
                    .unwrap_or(default.broker.expiry_interval_ms),
            },
            transport: TransportSettings {
                buffer_capacity: transport
                    .as_ref()
                    .and_then(|t| t.buffer_capacity)
                    .unwrap_or(default.transport.buffer_capacity),
                max_frame_size: transport
                    .as_ref()
                    .and_then(|t| t.max_frame_size)
                    .unwrap_or(default.transport.max_frame_size),
                max_message_size: transport
                    .as_ref()
                    .and_then(|t| t.max_message_size)
                    .unwrap_or(default.transport.max_message_size),
            },
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            transport: TransportSettings {
                buffer_capacity: DEFAULT_CAPACITY,
                max_frame_size: DEFAULT_MAX_FRAME_SIZE,
                max_message_size: MAX_MESSAGE_SIZE,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_redeliveries: 1,
            ack_timeout_ms: 30_000,
            expiry_interval_ms: 1_000,
        }
    }
}
