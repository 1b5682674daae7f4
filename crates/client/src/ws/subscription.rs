//! Per-consumer subscriptions.
//!
//! A [`Subscription`] turns a declarative `(room, enabled)` pair into room
//! registry operations. It keeps its own view of the connection state, so a
//! consumer whose handler failed shows `Error` without affecting the shared
//! connection or other consumers of the same room.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use roomlink_shared::{BroadcastEvent, CommandResponse, RoomId};

use super::connection::ConnectionState;
use super::lock;
use super::manager::ConnectionManager;
use super::rooms::{RoomGuard, RoomListener};
use crate::error::SubscriptionError;

pub type MessageHandler = Arc<dyn Fn(&BroadcastEvent) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

/// Callbacks for one subscription. Every slot is optional.
#[derive(Clone, Default)]
pub struct Handlers {
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    on_state: Option<StateHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BroadcastEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(handler));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SubscriptionError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Called with the subscription's local state whenever it changes.
    pub fn on_connection_state_change<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.on_state = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_connection_state_change", &self.on_state.is_some())
            .finish()
    }
}

struct FacadeState {
    room: RoomId,
    enabled: bool,
    /// Set by `disconnect()`, cleared by `reconnect()`.
    manual_off: bool,
    guard: Option<RoomGuard>,
    local: ConnectionState,
    error: Option<SubscriptionError>,
    handler_failed: bool,
}

impl FacadeState {
    fn wants_room(&self) -> bool {
        self.enabled && !self.manual_off
    }

    fn derive_local(&self, global: &ConnectionState) -> ConnectionState {
        if !self.wants_room() {
            return ConnectionState::Disconnected;
        }
        if global.is_error() {
            return global.clone();
        }
        if self.handler_failed {
            let reason = self
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "handler failed".to_string());
            return ConnectionState::Error { reason };
        }
        match global {
            ConnectionState::Connected if self.guard.is_some() => ConnectionState::Connected,
            ConnectionState::Reconnecting { attempt } => ConnectionState::Reconnecting { attempt: *attempt },
            _ => ConnectionState::Connecting,
        }
    }

    /// Forget a handler failure, e.g. when the room or enablement changes.
    fn reset_failure(&mut self) {
        self.handler_failed = false;
        self.error = None;
    }
}

struct Shared {
    manager: ConnectionManager,
    handlers: Mutex<Handlers>,
    state: Mutex<FacadeState>,
}

impl Shared {
    /// Bring the registration and local state in line with the inputs and
    /// the current global state.
    fn reconcile(self: &Arc<Self>) {
        let mut released = None;
        let mut transport_error = None;

        let changed = {
            let mut state = lock(&self.state);
            // Read under the facade lock so a concurrent reconcile cannot
            // overwrite a newer local state with one derived from an older
            // global state.
            let global = self.manager.state();
            if !state.wants_room() {
                released = state.guard.take();
            } else if state.guard.is_none() && global.is_connected() {
                let listener = FacadeListener {
                    shared: Arc::downgrade(self),
                };
                let guard = self
                    .manager
                    .rooms()
                    .subscribe_shared(state.room.clone(), Arc::new(listener));
                state.guard = Some(guard);
            }

            let local = state.derive_local(&global);
            if local == state.local {
                None
            } else {
                if let (true, ConnectionState::Error { reason }) = (state.wants_room(), &global) {
                    let error = SubscriptionError::Transport(reason.clone());
                    state.error = Some(error.clone());
                    transport_error = Some(error);
                }
                state.local = local.clone();
                Some(local)
            }
        };

        drop(released);
        if let Some(error) = transport_error {
            self.report_error(&error);
        }
        if let Some(local) = changed {
            self.report_state(&local);
        }
    }

    fn deliver(&self, event: &BroadcastEvent) {
        let handler = lock(&self.handlers).on_message.clone();
        let Some(handler) = handler else {
            return;
        };

        let message = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };
        crate::log_warn!(
            "Handler for room {} failed on {}: {}",
            event.room_id,
            event.event_type,
            message
        );
        self.fail(SubscriptionError::Handler {
            room: event.room_id.clone(),
            message,
        });
    }

    fn fail(&self, error: SubscriptionError) {
        let changed = {
            let mut state = lock(&self.state);
            state.handler_failed = true;
            state.error = Some(error.clone());
            let local = ConnectionState::Error {
                reason: error.to_string(),
            };
            if state.local == local {
                None
            } else {
                state.local = local.clone();
                Some(local)
            }
        };

        self.report_error(&error);
        if let Some(local) = changed {
            self.report_state(&local);
        }
    }

    fn rejected(&self, response: &CommandResponse) {
        let error = {
            let mut state = lock(&self.state);
            let room = response.room.clone().unwrap_or_else(|| state.room.clone());
            let error = SubscriptionError::CommandRejected {
                room,
                response: response.clone(),
            };
            state.error = Some(error.clone());
            error
        };
        self.report_error(&error);
    }

    fn report_error(&self, error: &SubscriptionError) {
        let handler = lock(&self.handlers).on_error.clone();
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                crate::log_error!("on_error handler panicked while reporting: {}", error);
            }
        }
    }

    fn report_state(&self, state: &ConnectionState) {
        let handler = lock(&self.handlers).on_state.clone();
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(state))).is_err() {
                crate::log_error!("on_connection_state_change handler panicked on {}", state);
            }
        }
    }
}

struct FacadeListener {
    shared: Weak<Shared>,
}

impl RoomListener for FacadeListener {
    fn on_event(&self, event: &BroadcastEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.deliver(event);
        }
    }

    fn on_command_rejected(&self, response: &CommandResponse) {
        if let Some(shared) = self.shared.upgrade() {
            shared.rejected(response);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", text)
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("panicked: {}", text)
    } else {
        "panicked".to_string()
    }
}

/// One consumer's interest in a room.
///
/// Created with [`ConnectionManager::subscribe`]. While enabled, the
/// subscription registers with the room registry as soon as the shared
/// connection is `Connected` and then stays registered across reconnects.
/// Dropping it releases the registration.
pub struct Subscription {
    shared: Arc<Shared>,
    observer: u64,
}

impl Subscription {
    pub(crate) fn new(
        manager: ConnectionManager,
        room: RoomId,
        enabled: bool,
        handlers: Handlers,
    ) -> Self {
        let initial = if enabled {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        };
        let shared = Arc::new(Shared {
            manager: manager.clone(),
            handlers: Mutex::new(handlers),
            state: Mutex::new(FacadeState {
                room,
                enabled,
                manual_off: false,
                guard: None,
                local: initial,
                error: None,
                handler_failed: false,
            }),
        });

        let weak = Arc::downgrade(&shared);
        let observer = manager.add_observer(Arc::new(move |_state: &ConnectionState| {
            if let Some(shared) = weak.upgrade() {
                shared.reconcile();
            }
        }));
        shared.reconcile();

        Self { shared, observer }
    }

    /// This subscription's local view of the connection.
    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.shared.state).local.clone()
    }

    /// The most recent error reported to this subscription.
    pub fn error(&self) -> Option<SubscriptionError> {
        lock(&self.shared.state).error.clone()
    }

    pub fn room(&self) -> RoomId {
        lock(&self.shared.state).room.clone()
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.shared.state).enabled
    }

    /// Whether the subscription currently holds a room registration.
    pub fn is_registered(&self) -> bool {
        lock(&self.shared.state).guard.is_some()
    }

    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = lock(&self.shared.state);
            if state.enabled == enabled {
                return;
            }
            state.enabled = enabled;
            if enabled {
                state.reset_failure();
            }
        }
        self.shared.reconcile();
    }

    /// Move the subscription to another room.
    pub fn set_room(&self, room: impl Into<RoomId>) {
        let room = room.into();
        let released = {
            let mut state = lock(&self.shared.state);
            if state.room == room {
                return;
            }
            crate::log_debug!("Subscription moving from {} to {}", state.room, room);
            state.room = room;
            state.reset_failure();
            state.guard.take()
        };
        drop(released);
        self.shared.reconcile();
    }

    /// Swap the callbacks. The next event uses the new ones; the room
    /// registration is left alone.
    pub fn set_handlers(&self, handlers: Handlers) {
        *lock(&self.shared.handlers) = handlers;
    }

    /// Release the room registration and hold the local state at
    /// `Disconnected` until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        lock(&self.shared.state).manual_off = true;
        self.shared.reconcile();
    }

    /// Lift a manual disconnect and clear any handler failure. Asks the
    /// shared connection to reconnect if it is down or has given up.
    pub fn reconnect(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.manual_off = false;
            state.reset_failure();
        }

        let manager = &self.shared.manager;
        if matches!(
            manager.state(),
            ConnectionState::Disconnected | ConnectionState::Error { .. }
        ) {
            manager.reconnect();
        }
        self.shared.reconcile();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Subscription")
            .field("room", &state.room)
            .field("enabled", &state.enabled)
            .field("state", &state.local)
            .field("registered", &state.guard.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.manager.remove_observer(self.observer);
        let released = lock(&self.shared.state).guard.take();
        drop(released);
    }
}
