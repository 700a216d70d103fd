//! Connection and node configuration.
//!
//! [`ConnectConfig`] is the only configuration contract an embedding
//! application has to produce to dial or listen on a transport.
//! [`NodeConfig`] holds the node-wide identity and timing knobs and is
//! usually loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Transport kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectType {
    /// Persistent WebSocket connection.
    #[default]
    Ws,
    /// One HTTP POST per packet.
    Http,
    /// Message-queue publish/consume.
    Mq,
}

impl fmt::Display for ConnectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectType::Ws => write!(f, "ws"),
            ConnectType::Http => write!(f, "http"),
            ConnectType::Mq => write!(f, "mq"),
        }
    }
}

/// Default outbound/inbound buffer size (packets).
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Immutable snapshot used to establish (and re-establish) a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// `host:port` to dial or bind. For MQ, the broker address.
    pub address: String,
    pub connect_type: ConnectType,
    /// Sign outbound packets and require signatures on inbound requests.
    pub enable_signature: bool,
    /// Negotiate a session key and encrypt payloads.
    pub enable_key_agreement: bool,
    /// Dial with `wss://` / `https://`.
    pub enable_ssl: bool,
    /// HTTP route.
    pub path: String,
    /// MQ account.
    pub account: String,
    /// MQ password.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// MQ exchange name.
    pub exchange: String,
    /// MQ queue the remote side consumes.
    pub send_queue: String,
    /// MQ queue this side consumes.
    pub receive_queue: String,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            connect_type: ConnectType::Ws,
            enable_signature: false,
            enable_key_agreement: false,
            enable_ssl: false,
            path: "/".to_string(),
            account: String::new(),
            password: String::new(),
            exchange: String::new(),
            send_queue: String::new(),
            receive_queue: String::new(),
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ConnectConfig {
    /// Config for a transport at `address` with everything else defaulted.
    pub fn new(connect_type: ConnectType, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_type,
            ..Default::default()
        }
    }

    /// URL used when dialing this config.
    pub fn url(&self) -> String {
        let scheme = match (self.connect_type, self.enable_ssl) {
            (ConnectType::Ws, false) => "ws",
            (ConnectType::Ws, true) => "wss",
            (ConnectType::Http, false) => "http",
            (ConnectType::Http, true) => "https",
            (ConnectType::Mq, false) => "amqp",
            (ConnectType::Mq, true) => "amqps",
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{scheme}://{}{path}", self.address)
    }
}

/// Node-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex-encoded 32-byte private key seed. Random identity when empty.
    pub private_key: String,
    /// How long a call may stay unanswered.
    pub request_timeout_ms: u64,
    /// Interval of the request timeout sweep.
    pub timeout_sweep_ms: u64,
    /// Heartbeat period of socket/MQ writer pumps.
    pub heartbeat_interval_ms: u64,
    /// Read deadline of socket/MQ reader pumps.
    pub read_timeout_ms: u64,
    /// Deadline of a single socket/MQ write.
    pub write_timeout_ms: u64,
    /// HTTP client round-trip timeout.
    pub http_timeout_ms: u64,
    /// Listeners started by embedding applications at boot.
    pub listen: Vec<ConnectConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            request_timeout_ms: 120_000,
            timeout_sweep_ms: 10_000,
            heartbeat_interval_ms: 54_000,
            read_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            http_timeout_ms: 30_000,
            listen: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn timeout_sweep(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_config_defaults() {
        let cfg = ConnectConfig::new(ConnectType::Http, "127.0.0.1:8422");
        assert_eq!(cfg.path, "/");
        assert_eq!(cfg.write_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.url(), "http://127.0.0.1:8422/");
    }

    #[test]
    fn test_url_respects_ssl_and_path() {
        let mut cfg = ConnectConfig::new(ConnectType::Ws, "node.example.com:443");
        cfg.enable_ssl = true;
        cfg.path = "owtp".to_string();
        assert_eq!(cfg.url(), "wss://node.example.com:443/owtp");
    }

    #[test]
    fn test_node_config_from_toml() {
        let toml_str = r#"
            request_timeout_ms = 5000

            [[listen]]
            address = "0.0.0.0:9500"
            connect_type = "mq"
            exchange = "owtp"
            receive_queue = "wallet-in"
            enable_signature = true
        "#;
        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.request_timeout_ms, 5000);
        assert_eq!(cfg.timeout_sweep_ms, 10_000);
        assert_eq!(cfg.listen.len(), 1);
        assert_eq!(cfg.listen[0].connect_type, ConnectType::Mq);
        assert!(cfg.listen[0].enable_signature);
        assert_eq!(cfg.listen[0].path, "/");
    }

    #[test]
    fn test_connect_config_equality_drives_reconnect() {
        let a = ConnectConfig::new(ConnectType::Ws, "127.0.0.1:1");
        let mut b = a.clone();
        assert_eq!(a, b);
        b.enable_key_agreement = true;
        assert_ne!(a, b);
    }
}
