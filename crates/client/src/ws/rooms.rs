//! Reference-counted room registry.
//!
//! Many local listeners can share one room; the server only ever sees one
//! `join` per room per physical connection, and one `leave` once the last
//! listener is gone. Membership survives reconnects: [`RoomRegistry::rejoin_all`]
//! re-joins every room that still has listeners whenever a new connection
//! comes up.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use roomlink_shared::{BroadcastEvent, CommandResponse, OutboundCommand, RoomId};

use super::lock;
use super::outbox::{Outbox, Stats};

/// Identifies one registered listener.
pub type ListenerId = u64;

/// Receives events for a room.
///
/// Plain closures taking `&BroadcastEvent` implement this trait.
pub trait RoomListener: Send + Sync + 'static {
    fn on_event(&self, event: &BroadcastEvent);

    /// The server answered a command for this room with a failure status.
    fn on_command_rejected(&self, _response: &CommandResponse) {}
}

impl<F> RoomListener for F
where
    F: Fn(&BroadcastEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &BroadcastEvent) {
        self(event)
    }
}

#[derive(Default)]
struct RoomEntry {
    listeners: Vec<(ListenerId, Arc<dyn RoomListener>)>,
    /// Link the `join` went out on.
    joined_link: Option<u64>,
    /// Token of a deferred `leave` waiting out the grace interval.
    pending_leave: Option<u64>,
}

/// Maps room ids to their listeners and drives join/leave commands.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, RoomEntry>>,
    outbox: Arc<Outbox>,
    stats: Arc<Stats>,
    next_id: AtomicU64,
    leave_grace: Duration,
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("rooms", &self.active_rooms())
            .field("leave_grace", &self.leave_grace)
            .finish_non_exhaustive()
    }
}

impl RoomRegistry {
    pub(crate) fn new(outbox: Arc<Outbox>, stats: Arc<Stats>, leave_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            outbox,
            stats,
            next_id: AtomicU64::new(1),
            leave_grace,
        })
    }

    /// Add a listener to `room`, joining it on the server if needed.
    ///
    /// The listener stays registered until the returned guard is dropped or
    /// released.
    pub fn subscribe(self: &Arc<Self>, room: impl Into<RoomId>, listener: impl RoomListener) -> RoomGuard {
        self.subscribe_shared(room.into(), Arc::new(listener))
    }

    pub(crate) fn subscribe_shared(
        self: &Arc<Self>,
        room: RoomId,
        listener: Arc<dyn RoomListener>,
    ) -> RoomGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut rooms = lock(&self.rooms);
            let entry = rooms.entry(room.clone()).or_default();
            if entry.pending_leave.take().is_some() {
                crate::log_debug!("Room {} reclaimed during leave grace", room);
            }
            entry.listeners.push((id, listener));
            crate::log_debug!(
                "Listener {} added to room {} ({} total)",
                id,
                room,
                entry.listeners.len()
            );
            self.ensure_joined(&room, entry);
        }

        RoomGuard {
            registry: Arc::downgrade(self),
            room,
            id,
            released: false,
        }
    }

    /// Remove one listener. Returns `false` if that pair was not registered,
    /// in which case nothing is sent.
    pub fn unsubscribe(self: &Arc<Self>, room: &RoomId, id: ListenerId) -> bool {
        let mut rooms = lock(&self.rooms);
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };

        let before = entry.listeners.len();
        entry.listeners.retain(|(listener_id, _)| *listener_id != id);
        if entry.listeners.len() == before {
            return false;
        }
        crate::log_debug!("Listener {} removed from room {}", id, room);

        if !entry.listeners.is_empty() || entry.pending_leave.is_some() {
            return true;
        }

        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(handle) if !self.leave_grace.is_zero() => {
                let token = self.next_id.fetch_add(1, Ordering::Relaxed);
                entry.pending_leave = Some(token);
                let registry = Arc::downgrade(self);
                let room = room.clone();
                let grace = self.leave_grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.finish_leave(&room, token);
                    }
                });
            }
            _ => {
                if let Some(entry) = rooms.remove(room) {
                    self.send_leave(room, entry.joined_link);
                }
            }
        }
        true
    }

    /// Deliver an event to every listener of its room.
    ///
    /// A panicking listener is logged and counted; the remaining listeners
    /// still get the event. Returns how many listeners were invoked.
    pub fn dispatch(&self, event: &BroadcastEvent) -> usize {
        let listeners = self.snapshot(&event.room_id);
        if listeners.is_empty() {
            crate::log_debug!(
                "No listeners for {} in room {}",
                event.event_type,
                event.room_id
            );
            return 0;
        }

        for (id, listener) in &listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if outcome.is_err() {
                Stats::bump(&self.stats.handler_errors);
                crate::log_error!(
                    "Listener {} panicked handling {} in room {}",
                    id,
                    event.event_type,
                    event.room_id
                );
            }
        }
        listeners.len()
    }

    /// Surface a failed command response to the listeners of its room.
    pub fn route_response(&self, response: &CommandResponse) -> usize {
        if response.is_success() {
            return 0;
        }
        let Some(room) = response.room.as_ref() else {
            return 0;
        };

        let listeners = self.snapshot(room);
        for (id, listener) in &listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_command_rejected(response)));
            if outcome.is_err() {
                Stats::bump(&self.stats.handler_errors);
                crate::log_error!("Listener {} panicked handling rejection for room {}", id, room);
            }
        }
        listeners.len()
    }

    /// Join every room that has listeners on the current connection.
    /// Rooms left empty during a leave grace are dropped instead.
    pub fn rejoin_all(&self) -> usize {
        let mut rooms = lock(&self.rooms);
        rooms.retain(|room, entry| {
            let keep = !entry.listeners.is_empty();
            if !keep {
                crate::log_debug!("Forgetting empty room {} on reconnect", room);
            }
            keep
        });

        let mut joined = 0;
        for (room, entry) in rooms.iter_mut() {
            if self.ensure_joined(room, entry) {
                joined += 1;
            }
        }
        if joined > 0 {
            crate::log_info!("Rejoined {} room(s)", joined);
        }
        joined
    }

    /// Rooms that currently have at least one listener.
    pub fn active_rooms(&self) -> Vec<RoomId> {
        let rooms = lock(&self.rooms);
        let mut active: Vec<RoomId> = rooms
            .iter()
            .filter(|(_, entry)| !entry.listeners.is_empty())
            .map(|(room, _)| room.clone())
            .collect();
        active.sort();
        active
    }

    pub fn subscriber_count(&self, room: &RoomId) -> usize {
        lock(&self.rooms)
            .get(room)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    fn snapshot(&self, room: &RoomId) -> Vec<(ListenerId, Arc<dyn RoomListener>)> {
        lock(&self.rooms)
            .get(room)
            .map(|entry| entry.listeners.clone())
            .unwrap_or_default()
    }

    /// Send `join` unless the room is already joined on the current link.
    /// Returns whether a join was written.
    fn ensure_joined(&self, room: &RoomId, entry: &mut RoomEntry) -> bool {
        let Some(link) = self.outbox.current_link() else {
            return false;
        };
        if entry.joined_link == Some(link) {
            return false;
        }
        match self.outbox.send(&OutboundCommand::join(room.clone())) {
            Ok(sent_on) => {
                entry.joined_link = Some(sent_on);
                true
            }
            Err(_) => false,
        }
    }

    fn send_leave(&self, room: &RoomId, joined_link: Option<u64>) {
        let current = self.outbox.current_link();
        if joined_link.is_none() || joined_link != current {
            crate::log_debug!("Room {} not joined on this connection; no leave needed", room);
            return;
        }
        let _ = self.outbox.send(&OutboundCommand::leave(room.clone()));
    }

    fn finish_leave(&self, room: &RoomId, token: u64) {
        let mut rooms = lock(&self.rooms);
        let expired = rooms
            .get(room)
            .is_some_and(|entry| entry.listeners.is_empty() && entry.pending_leave == Some(token));
        if expired {
            if let Some(entry) = rooms.remove(room) {
                self.send_leave(room, entry.joined_link);
            }
        }
    }
}

/// Keeps one listener registered. Dropping it unsubscribes.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct RoomGuard {
    registry: Weak<RoomRegistry>,
    room: RoomId,
    id: ListenerId,
    released: bool,
}

impl std::fmt::Debug for RoomGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomGuard")
            .field("room", &self.room)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl RoomGuard {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unsubscribe now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.room, self.id);
        }
    }
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
