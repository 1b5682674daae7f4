//! Room-multiplexed realtime client.
//!
//! This module provides:
//! - One shared connection per context, with backoff-driven auto-reconnect
//! - A reference-counted room registry that keeps one server-side join per room
//! - Per-consumer subscriptions with their own handlers and local state
//! - A dedup decorator for at-least-once event streams
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │ Subscription │ │ Subscription │ │ Subscription │
//! │  (room A)    │ │  (room A)    │ │  (room B)    │
//! └──────────────┘ └──────────────┘ └──────────────┘
//!          │              │              │
//!          └──────────────┼──────────────┘
//!                         ▼
//!              ┌─────────────────────┐
//!              │    RoomRegistry     │
//!              │ (1 join per room)   │
//!              └─────────────────────┘
//!                         │
//!                         ▼
//!              ┌─────────────────────┐
//!              │  ConnectionManager  │
//!              │ (state + reconnect) │
//!              └─────────────────────┘
//!                         │
//!                         ▼
//!              ┌─────────────────────┐
//!              │ Connector / socket  │
//!              └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(&config);
//! manager.connect(config.connect_options());
//!
//! let sub = manager.subscribe(
//!     "escalations:dashboard",
//!     true,
//!     Handlers::new().on_message(|event| {
//!         println!("{}: {}", event.event_type, event.data);
//!         Ok(())
//!     }),
//! );
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

mod connection;
mod dedup;
mod manager;
mod outbox;
mod rooms;
mod subscription;

#[cfg(test)]
mod testing;

pub use connection::{
    ConnectOptions, ConnectionState, Connector, Link, ReconnectConfig, TransportError,
    TungsteniteConnector,
};
pub use dedup::{dedupe_key, Dedup, DedupeSet};
pub use manager::ConnectionManager;
pub use outbox::ConnectionStats;
pub use rooms::{ListenerId, RoomGuard, RoomListener, RoomRegistry};
pub use subscription::{ErrorHandler, Handlers, MessageHandler, StateHandler, Subscription};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
