//! Roomlink Client - room-multiplexed realtime connection
//!
//! This crate contains the client side of roomlink: one shared WebSocket
//! connection per context, a reference-counted room registry on top of it,
//! and per-consumer subscriptions with their own handlers and state.

pub mod config;
pub mod error;
pub mod logging;
pub mod ws;

pub use config::ClientConfig;
pub use error::{ClientError, SubscriptionError};
pub use ws::{
    ConnectOptions, ConnectionManager, ConnectionState, Dedup, Handlers, RoomGuard, Subscription,
};
