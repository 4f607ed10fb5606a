//! Server configuration from environment variables. Every knob is
//! optional; invalid values fall back to the default with a warning.

use std::time::Duration;

use castpipe_protocol::packet::DEFAULT_MAX_PACKET_SIZE;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `PORT` — WebSocket listen port
    pub port: u16,
    /// `AUTH_KEY` — expected `authKey` query value; empty accepts all
    pub auth_key: String,
    /// `MAX_PACKET_SIZE` — framing ceiling in bytes
    pub max_packet_size: usize,
    /// `CHUNK_WAIT_TIMEOUT` — seconds of chunk silence before teardown
    pub chunk_wait_timeout: Duration,
    /// `CHUNK_WAIT_CHECK_INTERVAL` — watchdog tick, seconds
    pub chunk_wait_check_interval: Duration,
    /// `ICE_SERVERS` — comma-separated STUN/TURN URLs
    pub ice_servers: Vec<String>,
    /// `DEBUG` — truthy string raises the default log filter
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_key: String::new(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            chunk_wait_timeout: Duration::from_secs(10),
            chunk_wait_check_interval: Duration::from_secs(1),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            debug: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(value) = get("PORT") {
            apply_parsed("PORT", &value, &mut cfg.port);
        }
        if let Some(value) = get("AUTH_KEY") {
            cfg.auth_key = value;
        }
        if let Some(value) = get("MAX_PACKET_SIZE") {
            apply_parsed("MAX_PACKET_SIZE", &value, &mut cfg.max_packet_size);
        }
        if let Some(value) = get("CHUNK_WAIT_TIMEOUT") {
            let mut secs = cfg.chunk_wait_timeout.as_secs();
            apply_parsed("CHUNK_WAIT_TIMEOUT", &value, &mut secs);
            cfg.chunk_wait_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = get("CHUNK_WAIT_CHECK_INTERVAL") {
            let mut secs = cfg.chunk_wait_check_interval.as_secs();
            apply_parsed("CHUNK_WAIT_CHECK_INTERVAL", &value, &mut secs);
            cfg.chunk_wait_check_interval = Duration::from_secs(secs);
        }
        if let Some(value) = get("ICE_SERVERS") {
            let servers: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !servers.is_empty() {
                cfg.ice_servers = servers;
            }
        }
        if let Some(value) = get("DEBUG") {
            cfg.debug = is_truthy(&value);
        }

        cfg
    }
}

fn apply_parsed<T: std::str::FromStr>(name: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => {
            tracing::warn!(name, value, "Ignoring unparseable environment variable");
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = from_map(&[]);
        assert_eq!(cfg.port, 8080);
        assert!(cfg.auth_key.is_empty());
        assert_eq!(cfg.max_packet_size, 300 * 1024);
        assert_eq!(cfg.chunk_wait_timeout, Duration::from_secs(10));
        assert_eq!(cfg.chunk_wait_check_interval, Duration::from_secs(1));
        assert_eq!(cfg.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert!(!cfg.debug);
    }

    #[test]
    fn values_override_defaults() {
        let cfg = from_map(&[
            ("PORT", "9000"),
            ("AUTH_KEY", "secret"),
            ("MAX_PACKET_SIZE", "65536"),
            ("CHUNK_WAIT_TIMEOUT", "30"),
            ("CHUNK_WAIT_CHECK_INTERVAL", "5"),
            ("DEBUG", "true"),
        ]);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.auth_key, "secret");
        assert_eq!(cfg.max_packet_size, 65536);
        assert_eq!(cfg.chunk_wait_timeout, Duration::from_secs(30));
        assert_eq!(cfg.chunk_wait_check_interval, Duration::from_secs(5));
        assert!(cfg.debug);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = from_map(&[("PORT", "not-a-port"), ("MAX_PACKET_SIZE", "-5")]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.max_packet_size, 300 * 1024);
    }

    #[test]
    fn ice_servers_split_on_commas() {
        let cfg = from_map(&[(
            "ICE_SERVERS",
            "stun:stun.example.com:3478, turn:turn.example.com:3478",
        )]);
        assert_eq!(
            cfg.ice_servers,
            vec!["stun:stun.example.com:3478", "turn:turn.example.com:3478"]
        );
    }

    #[test]
    fn empty_ice_servers_keep_default() {
        let cfg = from_map(&[("ICE_SERVERS", " , ")]);
        assert_eq!(cfg.ice_servers, vec!["stun:stun.l.google.com:19302"]);
    }

    #[test]
    fn debug_truthiness() {
        for value in ["1", "true", "YES", "On"] {
            assert!(from_map(&[("DEBUG", value)]).debug, "{value}");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!from_map(&[("DEBUG", value)]).debug, "{value:?}");
        }
    }
}
