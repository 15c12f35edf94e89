use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the broadcast hub and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the bind address, the upgrade path and the origin allow-list
/// checked during the WebSocket handshake.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub allowed_origins: Vec<String>,
}

/// Configuration settings for the broadcast hub.
#[derive(Debug, Deserialize, Clone)]
pub struct HubSettings {
    /// Live connections beyond this are refused at the handshake.
    pub max_connections: usize,
    /// Per-connection outbound queue; overflowing it drops the connection.
    pub outbound_queue_capacity: usize,
    /// Upper bound for one socket write, and for draining queued deliveries
    /// when a connection closes.
    pub grace_timeout_ms: u64,
    /// How long an upgraded socket may wait before sending CONNECT.
    pub connect_timeout_ms: u64,
    /// SENDs under this prefix are published to that topic verbatim.
    pub broker_prefix: Option<String>,
    pub routes: Vec<RouteSettings>,
}

/// One entry of the routing table: an application destination pattern and
/// the topic template it publishes to. Both may use `{var}` segments.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    pub destination: String,
    pub topic: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub hub: Option<PartialHubSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialHubSettings {
    pub max_connections: Option<usize>,
    pub outbound_queue_capacity: Option<usize>,
    pub grace_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub broker_prefix: Option<String>,
    pub routes: Option<Vec<RouteSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Settings {
    /// Merge a partially specified configuration over the defaults.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server;
        let hub = partial.hub;

        Self {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                path: server
                    .as_ref()
                    .and_then(|s| s.path.clone())
                    .unwrap_or(default.server.path),
                allowed_origins: server
                    .as_ref()
                    .and_then(|s| s.allowed_origins.clone())
                    .unwrap_or(default.server.allowed_origins),
            },
            hub: HubSettings {
                max_connections: hub
                    .as_ref()
                    .and_then(|h| h.max_connections)
                    .unwrap_or(default.hub.max_connections),
                outbound_queue_capacity: hub
                    .as_ref()
                    .and_then(|h| h.outbound_queue_capacity)
                    .unwrap_or(default.hub.outbound_queue_capacity),
                grace_timeout_ms: hub
                    .as_ref()
                    .and_then(|h| h.grace_timeout_ms)
                    .unwrap_or(default.hub.grace_timeout_ms),
                connect_timeout_ms: hub
                    .as_ref()
                    .and_then(|h| h.connect_timeout_ms)
                    .unwrap_or(default.hub.connect_timeout_ms),
                // an explicitly empty prefix disables direct topic sends
                broker_prefix: match hub.as_ref().and_then(|h| h.broker_prefix.clone()) {
                    Some(prefix) if prefix.is_empty() => None,
                    Some(prefix) => Some(prefix),
                    None => default.hub.broker_prefix,
                },
                routes: hub
                    .as_ref()
                    .and_then(|h| h.routes.clone())
                    .unwrap_or(default.hub.routes),
            },
            log: LogSettings {
                level: partial
                    .log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl HubSettings {
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Provides default values for `Settings`.
///
/// The defaults reproduce the demo deployment: one `/chat` endpoint, the
/// local dev front-end as the only allowed origin, and a single route from
/// `/app/sendMessage` to `/topic/messages`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                path: "/chat".to_string(),
                allowed_origins: vec!["http://localhost:5173".to_string()],
            },
            hub: HubSettings {
                max_connections: 1000,
                outbound_queue_capacity: 256,
                grace_timeout_ms: 2000,
                connect_timeout_ms: 10_000,
                broker_prefix: Some("/topic/".to_string()),
                routes: vec![RouteSettings {
                    destination: "/app/sendMessage".to_string(),
                    topic: "/topic/messages".to_string(),
                }],
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
