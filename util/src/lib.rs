//! Pieces shared by the command line tools.
use flux::logging;
use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::process;
use tachyon::prelude::*;

/// Sent by the echo client, returned unchanged by the echo server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Echo {
    pub sequence: u32,
    pub text: String,
}

message!(Echo, "util::Echo");

/// Request answered by the echo server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sum(pub u32, pub u32);

message!(Sum, "util::Sum");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Total(pub u64);

message!(Total, "util::Total");

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Ws,
}

impl Transport {
    pub const NAMES: &'static [&'static str] = &["udp", "ws"];

    pub fn from_name(name: Option<&str>) -> Transport {
        match name {
            Some("ws") => Transport::Ws,
            _ => Transport::Udp,
        }
    }
}

pub fn exit_with(message: &str) -> ! {
    eprintln!("{}", message);
    process::exit(1)
}

/// Loads the config file, or the defaults when no path is given.
pub fn load_config(path: Option<&str>) -> NetConfig {
    match path {
        Some(path) => match NetConfig::load(path) {
            Ok(config) => config,
            Err(err) => exit_with(&format!("Failed to load config {}: {}", path, err)),
        },
        None => NetConfig::default(),
    }
}

/// The configured logger, or an info level terminal logger without a logging section.
pub fn logger(config: &NetConfig) -> logging::Logger {
    match config.logging {
        Some(_) => config.logger(),
        None => logging::terminal(logging::Severity::Info),
    }
}

/// Picks the override if given, the configured address otherwise.
pub fn address(overridden: Option<&str>, configured: &Option<String>) -> SocketAddr {
    let text = match overridden.or_else(|| configured.as_deref()) {
        Some(text) => text,
        None => exit_with("No address given"),
    };

    match text.parse() {
        Ok(address) => address,
        Err(_) => exit_with(&format!("Invalid address: {}", text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_names() {
        assert_eq!(Transport::from_name(Some("ws")), Transport::Ws);
        assert_eq!(Transport::from_name(Some("udp")), Transport::Udp);
        assert_eq!(Transport::from_name(None), Transport::Udp);
    }

    #[test]
    fn test_address_override_wins() {
        let configured = Some("127.0.0.1:9000".to_string());

        assert_eq!(address(Some("127.0.0.1:9100"), &configured).port(), 9100);
        assert_eq!(address(None, &configured).port(), 9000);
    }

    #[test]
    fn test_messages_have_distinct_ids() {
        assert_ne!(Echo::ID, Sum::ID);
        assert_ne!(Sum::ID, Total::ID);
        assert_eq!(Echo::NAME, "util::Echo");
    }
}
