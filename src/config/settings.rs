use serde::Deserialize;

use crate::persistence::fs_store::DEFAULT_BASE_PATH;
use crate::protocol::codec::DEFAULT_MAX_FRAME_BYTES;

/// Top-level configuration settings for the application.
///
/// Includes settings for the TCP server, the broker and logging.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// Defines the address the server binds to and how many sockets it keeps open.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

/// Configuration settings for the broker.
///
/// Where queues are stored and how the delivery loop paces retries.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub data_dir: String,
    pub retry_cooldown_secs: u64,
    pub idle_sleep_ms: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub data_dir: Option<String>,
    pub retry_cooldown_secs: Option<u64>,
    pub idle_sleep_ms: Option<u64>,
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 4742,
                max_connections: 1000,
            },
            broker: BrokerSettings {
                data_dir: DEFAULT_BASE_PATH.to_string(),
                retry_cooldown_secs: 5,
                idle_sleep_ms: 1,
                max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
                max_connections: server
                    .max_connections
                    .unwrap_or(defaults.server.max_connections),
            },
            broker: BrokerSettings {
                data_dir: broker.data_dir.unwrap_or(defaults.broker.data_dir),
                retry_cooldown_secs: broker
                    .retry_cooldown_secs
                    .unwrap_or(defaults.broker.retry_cooldown_secs),
                idle_sleep_ms: broker
                    .idle_sleep_ms
                    .unwrap_or(defaults.broker.idle_sleep_ms),
                max_frame_bytes: broker
                    .max_frame_bytes
                    .unwrap_or(defaults.broker.max_frame_bytes),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
        }
    }
}
