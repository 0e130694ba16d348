//! Loopback test helpers.
use crate::config::{ClientConfig, PeerTimeouts, ServerConfig};
use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

pub const PATIENCE: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Ping {
    pub value: u32,
}

crate::message!(Ping);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Square(pub u32);

crate::message!(Square);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Squared(pub u64);

crate::message!(Squared);

/// Spins on `condition` until it holds or `timeout` runs out.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(1));
    }

    condition()
}

/// Keeps calling `step` for the whole period.
pub fn idle_for<F: FnMut()>(period: Duration, mut step: F) {
    let deadline = Instant::now() + period;

    while Instant::now() < deadline {
        step();
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        address: None,
        handshake_timeout_ms: 1000,
        timeouts: fast_timeouts(),
        ..ServerConfig::default()
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        address: None,
        connect_timeout_ms: 2000,
        handshake_timeout_ms: 2000,
        timeouts: fast_timeouts(),
        ..ClientConfig::default()
    }
}

pub fn fast_timeouts() -> PeerTimeouts {
    PeerTimeouts {
        ping_interval_ms: 100,
        idle_timeout_ms: 3000,
    }
}
