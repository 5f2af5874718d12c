use std::time::Duration;

use serde::Deserialize;

use crate::transport::codec::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_TOPIC_LEN};

/// Top-level configuration settings for the application.
///
/// Includes settings for both the server and the message broker.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
}

/// Configuration settings for the server.
///
/// Defines the bind address, the runtime worker count (`0` lets tokio pick)
/// and the log level.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub worker_threads: usize,
    pub log_level: String,
}

/// Configuration settings for the broker.
///
/// Limits applied to every connection, plus the two protocol toggles.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub max_topic_len: usize,
    pub outbound_queue_capacity: usize,
    pub retain_on_subscribe: bool,
    pub require_connect: bool,
    /// How long a gracefully closed connection may spend flushing queued
    /// frames before they are abandoned.
    pub drain_timeout_ms: u64,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every key is optional here; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub worker_threads: Option<usize>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub max_frame_size: Option<usize>,
    pub max_topic_len: Option<usize>,
    pub outbound_queue_capacity: Option<usize>,
    pub retain_on_subscribe: Option<bool>,
    pub require_connect: Option<bool>,
    pub drain_timeout_ms: Option<u64>,
}

impl PartialSettings {
    /// Fill every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
                worker_threads: server
                    .worker_threads
                    .unwrap_or(defaults.server.worker_threads),
                log_level: server.log_level.unwrap_or(defaults.server.log_level),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .max_connections
                    .unwrap_or(defaults.broker.max_connections),
                max_frame_size: broker
                    .max_frame_size
                    .unwrap_or(defaults.broker.max_frame_size),
                max_topic_len: broker
                    .max_topic_len
                    .unwrap_or(defaults.broker.max_topic_len),
                outbound_queue_capacity: broker
                    .outbound_queue_capacity
                    .unwrap_or(defaults.broker.outbound_queue_capacity),
                retain_on_subscribe: broker
                    .retain_on_subscribe
                    .unwrap_or(defaults.broker.retain_on_subscribe),
                require_connect: broker
                    .require_connect
                    .unwrap_or(defaults.broker.require_connect),
                drain_timeout_ms: broker
                    .drain_timeout_ms
                    .unwrap_or(defaults.broker.drain_timeout_ms),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
                worker_threads: 0,
                log_level: "info".to_string(),
            },
            broker: BrokerSettings::default(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_topic_len: DEFAULT_MAX_TOPIC_LEN,
            outbound_queue_capacity: 1024,
            retain_on_subscribe: true,
            require_connect: false,
            drain_timeout_ms: 5000,
        }
    }
}

impl BrokerSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
