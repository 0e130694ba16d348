use flux::logging;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 28008;

/// Keep-alive tuning for one kind of link.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct PeerTimeouts {
    /// Interval between keep-alive pings.
    pub ping_interval_ms: u64,
    /// Silence after which the link is considered dead.
    pub idle_timeout_ms: u64,
}

impl PeerTimeouts {
    #[inline]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for PeerTimeouts {
    fn default() -> PeerTimeouts {
        PeerTimeouts {
            ping_interval_ms: 1000,
            idle_timeout_ms: 10_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub address: Option<String>,
    pub tick_interval_ms: u64,
    pub no_delay: bool,
    pub max_clients: u16,
    pub handshake_timeout_ms: u64,
    pub timeouts: PeerTimeouts,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: Some(format!("0.0.0.0:{}", DEFAULT_PORT)),
            tick_interval_ms: 1,
            no_delay: false,
            max_clients: 256,
            handshake_timeout_ms: 5000,
            timeouts: PeerTimeouts::default(),
        }
    }
}

impl ServerConfig {
    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub address: Option<String>,
    pub tick_interval_ms: u64,
    pub no_delay: bool,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub timeouts: PeerTimeouts,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            address: Some(format!("127.0.0.1:{}", DEFAULT_PORT)),
            tick_interval_ms: 1,
            no_delay: false,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            timeouts: PeerTimeouts::default(),
        }
    }
}

impl ClientConfig {
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PunchConfig {
    /// Rendezvous host address.
    pub rendezvous: Option<String>,
    /// Key the two sides of a punch agree on out of band.
    pub session: u64,
    pub tick_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub punch_interval_ms: u64,
    /// How long the listener keeps punching before giving up on the dialer.
    pub punch_timeout_ms: u64,
    pub rendezvous_timeouts: PeerTimeouts,
    pub data_timeouts: PeerTimeouts,
}

impl Default for PunchConfig {
    fn default() -> PunchConfig {
        PunchConfig {
            rendezvous: Some(format!("127.0.0.1:{}", DEFAULT_PORT + 1)),
            session: 0,
            tick_interval_ms: 1,
            connect_timeout_ms: 5000,
            punch_interval_ms: 100,
            punch_timeout_ms: 10_000,
            rendezvous_timeouts: PeerTimeouts {
                ping_interval_ms: 5000,
                idle_timeout_ms: 30_000,
            },
            data_timeouts: PeerTimeouts::default(),
        }
    }
}

impl PunchConfig {
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn punch_interval(&self) -> Duration {
        Duration::from_millis(self.punch_interval_ms)
    }

    #[inline]
    pub fn punch_timeout(&self) -> Duration {
        Duration::from_millis(self.punch_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    pub default_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> RpcConfig {
        RpcConfig {
            default_timeout_ms: 5000,
        }
    }
}

impl RpcConfig {
    #[inline]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub punch: PunchConfig,
    pub rpc: RpcConfig,
    #[serde(skip_serializing)]
    pub logging: Option<logging::LoggerConfig>,
}

impl NetConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> serdeconv::Result<NetConfig> {
        serdeconv::from_toml_file(path)
    }

    pub fn from_toml(text: &str) -> serdeconv::Result<NetConfig> {
        serdeconv::from_toml_str(text)
    }

    pub fn to_toml(&self) -> serdeconv::Result<String> {
        serdeconv::to_toml_string(self)
    }

    /// Logger described by the `logging` section, or a warning level terminal logger.
    pub fn logger(&self) -> logging::Logger {
        match self.logging.as_ref().map(logging::build) {
            Some(Ok(log)) => log,
            _ => logging::terminal(logging::Severity::Warning),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrip() {
        let config = NetConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = NetConfig::from_toml(&text).unwrap();

        assert_eq!(parsed.server, config.server);
        assert_eq!(parsed.client, config.client);
        assert_eq!(parsed.punch, config.punch);
        assert_eq!(parsed.rpc, config.rpc);
    }

    #[test]
    fn test_partial_config() {
        let parsed = NetConfig::from_toml(
            r#"
[server]
max_clients = 8

[punch.data_timeouts]
ping_interval_ms = 250
idle_timeout_ms = 2000

[logging]
type = "terminal"
level = "info"
"#,
        )
        .unwrap();

        assert_eq!(parsed.server.max_clients, 8);
        assert_eq!(parsed.server.tick_interval_ms, 1);
        assert_eq!(parsed.punch.data_timeouts.ping_interval(), Duration::from_millis(250));
        assert_eq!(parsed.punch.rendezvous_timeouts, PunchConfig::default().rendezvous_timeouts);
        assert!(parsed.logging.is_some());
    }

    #[test]
    fn test_bad_config() {
        assert!(NetConfig::from_toml("[server]\nmax_clients = \"many\"").is_err());
    }
}
