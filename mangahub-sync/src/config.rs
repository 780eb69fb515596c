//! Top-level configuration with environment overrides.
//!
//! Every component keeps its own config struct with a `Default`; this module
//! only aggregates them and applies `MANGAHUB_*` variables on top.

use std::time::Duration;

use crate::bridge::BridgeConfig;
use crate::tcp_hub::TcpHubConfig;
use crate::udp_hub::UdpHubConfig;
use crate::ws_hub::WsHubConfig;

/// Configuration for every service started by `SyncServices`.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub tcp: TcpHubConfig,
    pub udp: UdpHubConfig,
    pub ws: WsHubConfig,
    pub bridge: BridgeConfig,
    /// Messages kept per room by the in-memory chat history (0 = none)
    pub history_per_room: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tcp: TcpHubConfig::default(),
            udp: UdpHubConfig::default(),
            ws: WsHubConfig::default(),
            bridge: BridgeConfig::default(),
            history_per_room: 200,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let env = Env { lookup: &lookup };

        env.string("MANGAHUB_TCP_ADDR", &mut config.tcp.bind_addr);
        env.parse("MANGAHUB_TCP_QUEUE", &mut config.tcp.queue_capacity);

        env.string("MANGAHUB_UDP_ADDR", &mut config.udp.bind_addr);
        if let Some(secs) = env.value::<u64>("MANGAHUB_UDP_TTL_SECS") {
            config.udp.registration_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        env.parse("MANGAHUB_UDP_ADMIN_BROADCAST", &mut config.udp.allow_admin_broadcast);

        env.string("MANGAHUB_WS_ADDR", &mut config.ws.bind_addr);
        env.parse("MANGAHUB_WS_QUEUE", &mut config.ws.queue_capacity);
        if let Some(secs) = env.value::<u64>("MANGAHUB_WS_PING_SECS") {
            config.ws.ping_interval = Duration::from_secs(secs.max(1));
        }

        // Unset means the TCP hub started alongside the bridge
        config.bridge.tcp_addr = env.optional_string("MANGAHUB_BRIDGE_TCP_ADDR");
        env.string("MANGAHUB_RPC_ADDR", &mut config.bridge.rpc_addr);
        env.parse("MANGAHUB_BRIDGE_REDIAL", &mut config.bridge.redial_on_use);

        env.parse("MANGAHUB_HISTORY_PER_ROOM", &mut config.history_per_room);
        config
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.optional_string(key) {
            *target = value;
        }
    }

    fn optional_string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn value<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = (self.lookup)(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring {key}={raw}: not a valid value");
                None
            }
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, target: &mut T) {
        if let Some(value) = self.value(key) {
            *target = value;
        }
    }
}
