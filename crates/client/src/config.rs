//! Client configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::ws::{ConnectOptions, ReconnectConfig};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const DEFAULT_CLIENT_TYPE: &str = "dashboard";

/// Settings for one realtime connection context.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the room server.
    pub url: String,
    /// Sent as the `clientType` query parameter.
    pub client_type: String,
    pub reconnect: ReconnectConfig,
    /// How long an emptied room waits before `leave` is sent. Zero leaves
    /// immediately.
    pub leave_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
            reconnect: ReconnectConfig::default(),
            leave_grace: Duration::ZERO,
        }
    }
}

impl ClientConfig {
    /// Read configuration from the process environment.
    ///
    /// Environment variables:
    /// - `ROOMLINK_URL`: server endpoint (default: "ws://127.0.0.1:8080/ws")
    /// - `ROOMLINK_CLIENT_TYPE`: client type tag (default: "dashboard")
    /// - `ROOMLINK_RECONNECT_MAX_ATTEMPTS`: retries before giving up, 0 = forever (default: 10)
    /// - `ROOMLINK_RECONNECT_INITIAL_MS`: first retry delay (default: 1000)
    /// - `ROOMLINK_RECONNECT_MAX_MS`: backoff ceiling (default: 30000)
    /// - `ROOMLINK_LEAVE_GRACE_MS`: delay before leaving an emptied room (default: 0)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let reconnect = ReconnectConfig {
            max_attempts: parse_or(
                &lookup,
                "ROOMLINK_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
            initial_delay_ms: parse_or(
                &lookup,
                "ROOMLINK_RECONNECT_INITIAL_MS",
                defaults.reconnect.initial_delay_ms,
            ),
            max_delay_ms: parse_or(
                &lookup,
                "ROOMLINK_RECONNECT_MAX_MS",
                defaults.reconnect.max_delay_ms,
            ),
            ..defaults.reconnect
        };
        let leave_grace_ms: u64 = parse_or(&lookup, "ROOMLINK_LEAVE_GRACE_MS", 0);

        Self {
            url: lookup("ROOMLINK_URL").unwrap_or(defaults.url),
            client_type: lookup("ROOMLINK_CLIENT_TYPE").unwrap_or(defaults.client_type),
            reconnect,
            leave_grace: Duration::from_millis(leave_grace_ms),
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new(self.url.clone(), self.client_type.clone())
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            crate::log_warn!("Ignoring invalid {}={:?}, using default", key, raw);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ClientConfig::from_lookup(|_| None);
        assert_eq!(config.url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.client_type, "dashboard");
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.leave_grace, Duration::ZERO);
    }

    #[test]
    fn reads_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("ROOMLINK_URL", "wss://rt.example.com/socket"),
            ("ROOMLINK_CLIENT_TYPE", "agent"),
            ("ROOMLINK_RECONNECT_MAX_ATTEMPTS", "0"),
            ("ROOMLINK_RECONNECT_INITIAL_MS", "250"),
            ("ROOMLINK_LEAVE_GRACE_MS", "1500"),
        ]));
        assert_eq!(config.url, "wss://rt.example.com/socket");
        assert_eq!(config.client_type, "agent");
        assert_eq!(config.reconnect.max_attempts, 0);
        assert_eq!(config.reconnect.initial_delay_ms, 250);
        assert_eq!(config.reconnect.max_delay_ms, 30000);
        assert_eq!(config.leave_grace, Duration::from_millis(1500));
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = ClientConfig::from_lookup(lookup_from(&[(
            "ROOMLINK_RECONNECT_MAX_ATTEMPTS",
            "lots",
        )]));
        assert_eq!(config.reconnect.max_attempts, 10);
    }
}
