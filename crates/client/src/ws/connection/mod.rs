//! Connection state, reconnect policy and the transport seam.
//!
//! The manager never touches a socket directly. It asks a [`Connector`] for a
//! [`Link`]: a pair of text channels whose far ends are pumped to and from
//! the physical connection. The inbound channel closing means the connection
//! is gone.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Connection state for the shared connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Error { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    /// Connecting, connected, or waiting to retry.
    pub fn is_active(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            ConnectionState::Error { reason } => write!(f, "error: {}", reason),
        }
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
    /// Fraction of each delay that may be shaved off at random (0.0 - 1.0)
    pub jitter: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u32).min(self.max_delay_ms)
    }

    /// Backoff delay with random jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt) as f32;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 - rand::thread_rng().gen_range(0.0..jitter)
        } else {
            1.0
        };
        Duration::from_millis((base * factor) as u64)
    }

    /// Whether `attempt` retries already used up the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Where and as what to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub url: String,
    pub client_type: String,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>, client_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_type: client_type.into(),
        }
    }

    /// The URL actually dialed, with `clientType` appended as a query parameter.
    pub fn endpoint(&self) -> Result<url::Url, TransportError> {
        let mut url = url::Url::parse(&self.url).map_err(|e| TransportError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !self.client_type.is_empty() {
            url.query_pairs_mut()
                .append_pair("clientType", &self.client_type);
        }
        Ok(url)
    }
}

/// Failure to open, or loss of, the physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid connection url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to open connection: {0}")]
    Open(String),
}

/// An open physical connection, seen as two text channels.
#[derive(Debug)]
pub struct Link {
    /// Frames to write to the server. Dropping it closes the connection.
    pub outbound: UnboundedSender<String>,
    /// Frames read from the server. Ends when the connection closes.
    pub inbound: UnboundedReceiver<String>,
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, options: &ConnectOptions) -> Result<Link, TransportError>;
}

mod connection_native;
pub use connection_native::TungsteniteConnector;
