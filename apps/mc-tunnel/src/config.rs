use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::telemetry::env_truthy;
use crate::timeout::{
    FILE_IO_TIMEOUT, NETWORK_TIMEOUT, PATH_DISCOVERY_TIMEOUT, TCP_CONNECT_TIMEOUT,
};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "minecraft";
pub const DEFAULT_GAME_PORT: u16 = 25565;

/// Tunnel configuration shared by the establisher, the proxies and the CLI.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// STUN/TURN urls used for path discovery
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    pub ordered: bool,
    pub path_discovery_timeout: Duration,
    pub dial_timeout: Duration,
    pub listen_timeout: Duration,
    pub file_io_timeout: Duration,
    /// Address of the game server the host side exposes
    pub host_target: String,
    pub joiner_bind: IpAddr,
    /// Port the joiner side listens on for local game clients (0 = ephemeral)
    pub joiner_port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: true,
            path_discovery_timeout: PATH_DISCOVERY_TIMEOUT,
            dial_timeout: TCP_CONNECT_TIMEOUT,
            listen_timeout: NETWORK_TIMEOUT,
            file_io_timeout: FILE_IO_TIMEOUT,
            host_target: format!("localhost:{DEFAULT_GAME_PORT}"),
            joiner_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            joiner_port: DEFAULT_GAME_PORT,
        }
    }
}

impl TunnelConfig {
    /// Load configuration from `MC_TUNNEL_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(list) = env::var("MC_TUNNEL_STUN") {
            config.ice_servers = list
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if env_truthy("MC_TUNNEL_DISABLE_STUN").unwrap_or(false) {
            config.ice_servers.clear();
        }
        if let Some(secs) = env::var("MC_TUNNEL_ICE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.path_discovery_timeout = Duration::from_secs(secs);
        }
        if let Ok(target) = env::var("MC_TUNNEL_TARGET") {
            if !target.trim().is_empty() {
                config.host_target = target.trim().to_string();
            }
        }
        if let Some(port) = env::var("MC_TUNNEL_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            config.joiner_port = port;
        }
        config
    }

    /// No STUN servers: host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            joiner_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_path_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.path_discovery_timeout = timeout;
        self
    }

    pub fn with_host_target(mut self, target: impl Into<String>) -> Self {
        self.host_target = target.into();
        self
    }

    pub fn with_joiner_port(mut self, port: u16) -> Self {
        self.joiner_port = port;
        self
    }

    pub fn joiner_addr(&self) -> SocketAddr {
        SocketAddr::new(self.joiner_bind, self.joiner_port)
    }

    pub(crate) fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_servers.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_servers.clone(),
            ..Default::default()
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "MC_TUNNEL_STUN",
        "MC_TUNNEL_DISABLE_STUN",
        "MC_TUNNEL_ICE_TIMEOUT_SECS",
        "MC_TUNNEL_TARGET",
        "MC_TUNNEL_PORT",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn defaults_match_game_setup() {
        let config = TunnelConfig::default();
        assert_eq!(config.channel_label, "minecraft");
        assert_eq!(config.host_target, "localhost:25565");
        assert_eq!(config.joiner_port, 25565);
        assert_eq!(config.path_discovery_timeout, Duration::from_secs(30));
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn localhost_has_no_ice_servers() {
        let config = TunnelConfig::localhost();
        assert!(config.ice_servers.is_empty());
        assert!(config.rtc_ice_servers().is_empty());
        assert_eq!(config.joiner_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn from_env_without_overrides_is_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = TunnelConfig::from_env();
        assert_eq!(config.host_target, TunnelConfig::default().host_target);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn from_env_applies_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("MC_TUNNEL_STUN", "stun:a.example:3478, stun:b.example:3478");
            env::set_var("MC_TUNNEL_ICE_TIMEOUT_SECS", "7");
            env::set_var("MC_TUNNEL_TARGET", "10.0.0.5:25566");
            env::set_var("MC_TUNNEL_PORT", "30000");
        }
        let config = TunnelConfig::from_env();
        clear_env();
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "stun:b.example:3478".to_string()]
        );
        assert_eq!(config.path_discovery_timeout, Duration::from_secs(7));
        assert_eq!(config.host_target, "10.0.0.5:25566");
        assert_eq!(config.joiner_port, 30000);
    }

    #[test]
    fn disable_stun_wins() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("MC_TUNNEL_DISABLE_STUN", "1") };
        let config = TunnelConfig::from_env();
        clear_env();
        assert!(config.ice_servers.is_empty());
    }
}
