//! The write side of the shared connection, plus connection counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use roomlink_shared::OutboundCommand;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::lock;
use crate::error::ClientError;

/// Counters kept for the life of a connection context.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub frames_received: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub handler_errors: AtomicU64,
    pub commands_sent: AtomicU64,
    pub commands_dropped: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub frames_received: u64,
    /// Inbound frames that matched neither known shape.
    pub protocol_errors: u64,
    /// Room callbacks that panicked during dispatch.
    pub handler_errors: u64,
    pub commands_sent: u64,
    /// Commands dropped because the connection was not up.
    pub commands_dropped: u64,
    pub reconnects: u64,
}

struct ActiveLink {
    id: u64,
    tx: UnboundedSender<String>,
}

/// Holds the writer of the current physical connection, if any.
///
/// Each successfully opened connection gets a new link id, which lets the
/// room registry tell whether a room was joined on the connection that is
/// up right now.
pub(crate) struct Outbox {
    link: Mutex<Option<ActiveLink>>,
    stats: Arc<Stats>,
}

impl Outbox {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            link: Mutex::new(None),
            stats,
        }
    }

    pub fn attach(&self, id: u64, tx: UnboundedSender<String>) {
        *lock(&self.link) = Some(ActiveLink { id, tx });
    }

    pub fn clear(&self) {
        lock(&self.link).take();
    }

    pub fn current_link(&self) -> Option<u64> {
        lock(&self.link).as_ref().map(|link| link.id)
    }

    /// Write a command to the current link. Returns the id of the link it
    /// went out on. Never queues: without a link the command is dropped.
    pub fn send(&self, command: &OutboundCommand) -> Result<u64, ClientError> {
        let guard = lock(&self.link);
        let Some(link) = guard.as_ref() else {
            Stats::bump(&self.stats.commands_dropped);
            crate::log_warn!(
                "Dropping {} for room {}: not connected",
                command.action,
                command.room
            );
            return Err(ClientError::NotConnected {
                action: command.action,
                room: command.room.clone(),
            });
        };

        let json = command.encode()?;
        if link.tx.send(json).is_err() {
            Stats::bump(&self.stats.commands_dropped);
            crate::log_warn!(
                "Dropping {} for room {}: connection writer closed",
                command.action,
                command.room
            );
            return Err(ClientError::LinkClosed {
                action: command.action,
                room: command.room.clone(),
            });
        }

        Stats::bump(&self.stats.commands_sent);
        crate::log_debug!("Sent {} for room {} on link {}", command.action, command.room, link.id);
        Ok(link.id)
    }
}
