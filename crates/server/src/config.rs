//! Server configuration from environment variables.

use std::net::SocketAddr;

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_ROOM_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Broadcast buffer per room. Slow subscribers that fall further behind
    /// skip the missed events.
    pub room_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            room_capacity: DEFAULT_ROOM_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ROOMLINK_BIND`: listen address (default: "0.0.0.0:8080")
    /// - `ROOMLINK_ROOM_CAPACITY`: broadcast buffer per room (default: 100)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let bind = match lookup("ROOMLINK_BIND") {
            None => defaults.bind,
            Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
                tracing::warn!("Invalid ROOMLINK_BIND={:?} ({}), using {}", raw, e, DEFAULT_BIND);
                defaults.bind
            }),
        };
        let room_capacity = match lookup("ROOMLINK_ROOM_CAPACITY") {
            None => defaults.room_capacity,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => {
                    tracing::warn!("Invalid ROOMLINK_ROOM_CAPACITY={:?}, using {}", raw, DEFAULT_ROOM_CAPACITY);
                    defaults.room_capacity
                }
            },
        };

        Self { bind, room_capacity }
    }
}
