//! In-memory connector for driving the manager from tests.

use std::time::Duration;

use async_trait::async_trait;
use roomlink_shared::OutboundCommand;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::connection::{ConnectOptions, ConnectionState, Connector, Link, ReconnectConfig, TransportError};
use super::manager::ConnectionManager;
use crate::config::ClientConfig;

/// Connector whose every `open` call is handed to the test to accept or fail.
pub(crate) struct ScriptedConnector {
    requests: mpsc::UnboundedSender<OpenRequest>,
}

impl ScriptedConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OpenRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Self { requests }, rx)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, options: &ConnectOptions) -> Result<Link, TransportError> {
        let (reply, outcome) = oneshot::channel();
        let request = OpenRequest {
            options: options.clone(),
            reply,
        };
        if self.requests.send(request).is_err() {
            return Err(TransportError::Open("test dropped the request channel".into()));
        }
        outcome
            .await
            .unwrap_or_else(|_| Err(TransportError::Open("test dropped the open request".into())))
    }
}

/// A pending `open` call.
pub(crate) struct OpenRequest {
    pub options: ConnectOptions,
    reply: oneshot::Sender<Result<Link, TransportError>>,
}

impl OpenRequest {
    /// Complete the open and return the server side of the link.
    pub fn accept(self) -> ServerEnd {
        let (outbound, commands) = mpsc::unbounded_channel();
        let (frames, inbound) = mpsc::unbounded_channel();
        let _ = self.reply.send(Ok(Link { outbound, inbound }));
        ServerEnd { commands, frames }
    }

    pub fn fail(self, reason: &str) {
        let _ = self.reply.send(Err(TransportError::Open(reason.to_string())));
    }
}

/// Server side of an accepted link.
pub(crate) struct ServerEnd {
    commands: mpsc::UnboundedReceiver<String>,
    frames: mpsc::UnboundedSender<String>,
}

impl ServerEnd {
    /// Drain the commands the client has written so far.
    pub fn commands(&mut self) -> Vec<OutboundCommand> {
        let mut out = Vec::new();
        while let Ok(text) = self.commands.try_recv() {
            out.push(serde_json::from_str(&text).expect("client wrote invalid json"));
        }
        out
    }

    pub fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.frames.send(text.to_string());
    }

    /// Drop the connection from the server side.
    pub fn close(self) {}
}

/// Reconnect settings without jitter and with short delays.
pub(crate) fn test_config() -> ClientConfig {
    ClientConfig {
        url: "ws://test.invalid/ws".to_string(),
        client_type: "dashboard".to_string(),
        reconnect: ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        },
        leave_grace: Duration::ZERO,
    }
}

/// Let spawned tasks run until they block.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub(crate) async fn wait_for_state(
    manager: &ConnectionManager,
    predicate: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut states = manager.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(60), states.wait_for(|state| predicate(state)))
        .await
        .expect("timed out waiting for connection state")
        .expect("state channel closed")
        .clone();
    state
}
