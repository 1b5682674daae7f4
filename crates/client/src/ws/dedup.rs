//! Duplicate suppression for at-least-once event streams.
//!
//! The router delivers every frame it receives, so a room event can reach a
//! handler more than once (server retries, a late delivery after a rejoin).
//! Consumers whose effect must happen once, like a notification banner, wrap
//! their handler in a [`Dedup`].

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use roomlink_shared::BroadcastEvent;
use serde_json::Value;

use super::lock;

/// Keys already seen by one consumer.
#[derive(Debug, Default)]
pub struct DedupeSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: Option<usize>,
}

impl DedupeSet {
    /// Unbounded set: keys live as long as the set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set that forgets its oldest key once more than `capacity` are held.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if self.seen.contains(&key) {
            return false;
        }

        if let Some(capacity) = self.capacity {
            while self.order.len() >= capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.seen.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.order.push_back(key.clone());
        }
        self.seen.insert(key);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Key for a payload: `primary` if present, else `secondary`, else the
/// current time, which never matches an earlier event.
pub fn dedupe_key(data: &Value, primary: &str, secondary: &str) -> String {
    for field in [primary, secondary] {
        match data.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(id)) => return format!("{}:{}", field, id),
            Some(other) => return format!("{}:{}", field, other),
        }
    }
    let now = Utc::now();
    format!(
        "ts:{}",
        now.timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000))
    )
}

type KeyFn = Box<dyn Fn(&BroadcastEvent) -> String + Send + Sync>;

/// Wraps an effect so it runs at most once per dedupe key.
pub struct Dedup<F> {
    seen: Mutex<DedupeSet>,
    key: KeyFn,
    effect: F,
}

impl<F> Dedup<F>
where
    F: Fn(&BroadcastEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    /// Key events by a payload field, falling back to a second field.
    pub fn by_fields(primary: &'static str, secondary: &'static str, effect: F) -> Self {
        Self::with_key(move |event| dedupe_key(&event.data, primary, secondary), effect)
    }

    pub fn with_key<K>(key: K, effect: F) -> Self
    where
        K: Fn(&BroadcastEvent) -> String + Send + Sync + 'static,
    {
        Self {
            seen: Mutex::new(DedupeSet::new()),
            key: Box::new(key),
            effect,
        }
    }

    /// Bound the number of remembered keys.
    pub fn capacity_limit(self, capacity: usize) -> Self {
        Self {
            seen: Mutex::new(DedupeSet::with_capacity_limit(capacity)),
            ..self
        }
    }

    /// Run the effect unless this event's key was seen before.
    pub fn handle(&self, event: &BroadcastEvent) -> anyhow::Result<()> {
        let key = (self.key)(event);
        if !lock(&self.seen).insert(key.clone()) {
            crate::log_debug!("Suppressed duplicate {} ({}) in room {}", event.event_type, key, event.room_id);
            return Ok(());
        }
        (self.effect)(event)
    }

    pub fn seen(&self) -> usize {
        lock(&self.seen).len()
    }

    /// Turn into a message handler for [`Handlers::on_message`](super::Handlers::on_message).
    pub fn into_handler(self) -> impl Fn(&BroadcastEvent) -> anyhow::Result<()> + Send + Sync + 'static {
        move |event: &BroadcastEvent| self.handle(event)
    }
}

impl<F> std::fmt::Debug for Dedup<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dedup")
            .field("seen", &lock(&self.seen).len())
            .finish_non_exhaustive()
    }
}
