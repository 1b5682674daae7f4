//! The shared connection: lifecycle state machine, reconnect driver and
//! inbound frame routing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use roomlink_shared::{decode_frame, CommandResponse, InboundFrame, OutboundCommand, RoomId};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::connection::{
    ConnectOptions, ConnectionState, Connector, Link, ReconnectConfig, TungsteniteConnector,
};
use super::lock;
use super::outbox::{ConnectionStats, Outbox, Stats};
use super::rooms::{RoomGuard, RoomListener, RoomRegistry};
use super::subscription::{Handlers, Subscription};
use crate::config::ClientConfig;
use crate::error::ClientError;

const RESPONSE_BUFFER: usize = 64;

pub(crate) type StateObserver = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

/// Handle to one realtime connection context.
///
/// Create one at application start and hand clones to whatever needs it.
/// All clones share the same physical connection, room registry and state.
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("rooms", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

struct Control {
    /// Bumped on every connect/disconnect; a driver with an older epoch is stale.
    epoch: u64,
    state: ConnectionState,
    driver: Option<JoinHandle<()>>,
    options: Option<ConnectOptions>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectConfig,
    outbox: Arc<Outbox>,
    registry: Arc<RoomRegistry>,
    stats: Arc<Stats>,
    control: Mutex<Control>,
    state_tx: watch::Sender<ConnectionState>,
    responses: broadcast::Sender<CommandResponse>,
    observers: Mutex<Vec<(u64, StateObserver)>>,
    next_observer: AtomicU64,
    next_link: AtomicU64,
}

impl ConnectionManager {
    /// Manager using the WebSocket transport.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_connector(TungsteniteConnector, config)
    }

    pub fn with_connector(connector: impl Connector, config: &ClientConfig) -> Self {
        let stats = Arc::new(Stats::default());
        let outbox = Arc::new(Outbox::new(Arc::clone(&stats)));
        let registry = RoomRegistry::new(Arc::clone(&outbox), Arc::clone(&stats), config.leave_grace);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (responses, _) = broadcast::channel(RESPONSE_BUFFER);

        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                reconnect: config.reconnect.clone(),
                outbox,
                registry,
                stats,
                control: Mutex::new(Control {
                    epoch: 0,
                    state: ConnectionState::Disconnected,
                    driver: None,
                    options: None,
                }),
                state_tx,
                responses,
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
                next_link: AtomicU64::new(1),
            }),
        }
    }

    /// Open the shared connection. A no-op while already connecting,
    /// connected, or waiting to retry.
    pub fn connect(&self, options: ConnectOptions) {
        {
            let mut control = lock(&self.inner.control);
            if control.state.is_active() {
                crate::log_debug!("connect() ignored: already {}", control.state);
                return;
            }

            control.epoch += 1;
            let epoch = control.epoch;
            control.options = Some(options.clone());
            control.state = ConnectionState::Connecting;
            crate::log_info!("Connecting to {} as {}", options.url, options.client_type);
            control.driver = Some(tokio::spawn(drive(
                Arc::downgrade(&self.inner),
                epoch,
                options,
            )));
        }
        self.inner.publish();
    }

    /// Close the connection. Room listeners stay registered so a later
    /// [`connect`](Self::connect) rejoins their rooms.
    pub fn disconnect(&self) {
        let driver = {
            let mut control = lock(&self.inner.control);
            control.epoch += 1;
            self.inner.outbox.clear();
            if control.state != ConnectionState::Disconnected {
                crate::log_info!("Disconnecting (was {})", control.state);
            }
            control.state = ConnectionState::Disconnected;
            control.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        self.inner.publish();
    }

    /// Drop the current connection and start over with the last options.
    /// Returns `false` if [`connect`](Self::connect) was never called.
    pub fn reconnect(&self) -> bool {
        let options = lock(&self.inner.control).options.clone();
        let Some(options) = options else {
            crate::log_warn!("reconnect() ignored: never connected");
            return false;
        };
        self.disconnect();
        self.connect(options);
        true
    }

    /// Write a command if connected; otherwise it is dropped and logged.
    pub fn send(&self, command: OutboundCommand) -> Result<(), ClientError> {
        self.inner.outbox.send(&command).map(|_| ())
    }

    pub fn send_message(&self, room: RoomId, data: Value) -> Result<(), ClientError> {
        self.send(OutboundCommand::message(room, data))
    }

    pub fn claim(&self, room: RoomId, data: Value) -> Result<(), ClientError> {
        self.send(OutboundCommand::claim(room, data))
    }

    pub fn request_stats(&self, room: RoomId) -> Result<(), ClientError> {
        self.send(OutboundCommand::stats(room))
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.control).state.clone()
    }

    /// Receiver that always holds the latest connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every command response received from now on.
    pub fn command_responses(&self) -> broadcast::Receiver<CommandResponse> {
        self.inner.responses.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.inner.registry
    }

    /// Register a raw room listener directly with the registry.
    pub fn subscribe_room(&self, room: impl Into<RoomId>, listener: impl RoomListener) -> RoomGuard {
        self.inner.registry.subscribe(room, listener)
    }

    /// Create a consumer subscription. See [`Subscription`].
    pub fn subscribe(&self, room: impl Into<RoomId>, enabled: bool, handlers: Handlers) -> Subscription {
        Subscription::new(self.clone(), room.into(), enabled, handlers)
    }

    pub(crate) fn add_observer(&self, observer: StateObserver) -> u64 {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.observers).push((id, observer));
        id
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        lock(&self.inner.observers).retain(|(observer_id, _)| *observer_id != id);
    }
}

impl Inner {
    /// Move to `state` if `epoch` is still current.
    fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        {
            let mut control = lock(&self.control);
            if control.epoch != epoch {
                return false;
            }
            if control.state == state {
                return true;
            }
            crate::log_info!("Connection state: {} -> {}", control.state, state);
            control.state = state;
        }
        self.publish();
        true
    }

    /// Tell observers and watchers about the current state.
    fn publish(&self) {
        let state = lock(&self.control).state.clone();
        let observers: Vec<StateObserver> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&state))).is_err() {
                crate::log_error!("State observer panicked on {}", state);
            }
        }
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Install a freshly opened link, mark the connection up and rejoin rooms.
    fn attach_link(&self, epoch: u64, link: Link) -> Option<(u64, mpsc::UnboundedReceiver<String>)> {
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        {
            let mut control = lock(&self.control);
            if control.epoch != epoch {
                return None;
            }
            self.outbox.attach(link_id, link.outbound);
            crate::log_info!("Connection state: {} -> connected (link {})", control.state, link_id);
            control.state = ConnectionState::Connected;
        }
        self.registry.rejoin_all();
        self.publish();
        Some((link_id, link.inbound))
    }

    fn detach_link(&self, epoch: u64) -> bool {
        let control = lock(&self.control);
        if control.epoch != epoch {
            return false;
        }
        self.outbox.clear();
        true
    }

    /// Route one inbound text frame. Returns `false` if the driver is stale.
    fn handle_frame(&self, epoch: u64, text: &str) -> bool {
        if lock(&self.control).epoch != epoch {
            return false;
        }
        Stats::bump(&self.stats.frames_received);

        match decode_frame(text) {
            Ok(InboundFrame::Broadcast(event)) => {
                self.registry.dispatch(&event);
            }
            Ok(InboundFrame::Response(response)) => {
                if response.is_success() {
                    crate::log_debug!("Command response: {} (room {:?})", response.status, response.room);
                } else {
                    crate::log_warn!(
                        "Command rejected: {} code={:?} message={:?} room={:?}",
                        response.status,
                        response.code,
                        response.message,
                        response.room
                    );
                }
                self.registry.route_response(&response);
                let _ = self.responses.send(response);
            }
            Err(e) => {
                Stats::bump(&self.stats.protocol_errors);
                let preview: String = text.chars().take(120).collect();
                crate::log_warn!("Dropping invalid frame ({}): {}", e, preview);
            }
        }
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(control) = self.control.get_mut() {
            if let Some(driver) = control.driver.take() {
                driver.abort();
            }
        }
    }
}

/// Connection driver: one per connect() call. Owns the retry timer, so at
/// most one reconnect is ever pending.
async fn drive(inner: Weak<Inner>, epoch: u64, options: ConnectOptions) {
    let mut attempt = 0u32;

    loop {
        let Some(connector) = inner.upgrade().map(|strong| Arc::clone(&strong.connector)) else {
            return;
        };
        let opened = connector.open(&options).await;
        let Some(strong) = inner.upgrade() else {
            return;
        };

        let delay = match opened {
            Ok(link) => {
                attempt = 0;
                let Some((link_id, mut inbound)) = strong.attach_link(epoch, link) else {
                    return;
                };
                drop(strong);

                while let Some(text) = inbound.recv().await {
                    let Some(strong) = inner.upgrade() else {
                        return;
                    };
                    if !strong.handle_frame(epoch, &text) {
                        return;
                    }
                }

                let Some(strong) = inner.upgrade() else {
                    return;
                };
                if !strong.detach_link(epoch) {
                    return;
                }
                crate::log_warn!("Connection lost (link {})", link_id);
                strong.schedule_retry(epoch, &mut attempt)
            }
            Err(e) => {
                crate::log_error!("Connection to {} failed: {}", options.url, e);
                if strong.reconnect.is_exhausted(attempt) {
                    let reason = format!(
                        "Max reconnect attempts ({}) exceeded: {}",
                        strong.reconnect.max_attempts, e
                    );
                    strong.transition(epoch, ConnectionState::Error { reason });
                    return;
                }
                let delay = strong.schedule_retry(epoch, &mut attempt);
                drop(strong);
                delay
            }
        };

        let Some(delay) = delay else {
            return;
        };
        tokio::time::sleep(delay).await;
    }
}

impl Inner {
    /// Move to `Reconnecting` and pick the backoff delay. `None` if stale.
    fn schedule_retry(&self, epoch: u64, attempt: &mut u32) -> Option<Duration> {
        let delay = self.reconnect.jittered_delay(*attempt);
        *attempt += 1;
        if !self.transition(epoch, ConnectionState::Reconnecting { attempt: *attempt }) {
            return None;
        }
        Stats::bump(&self.stats.reconnects);
        crate::log_info!("Reconnecting in {}ms (attempt {})", delay.as_millis(), attempt);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::testing::{settle, test_config, wait_for_state, ScriptedConnector};
    use roomlink_shared::{Action, BroadcastEvent};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> (ConnectionManager, mpsc::UnboundedReceiver<crate::ws::testing::OpenRequest>) {
        let (connector, requests) = ScriptedConnector::new();
        (ConnectionManager::with_connector(connector, &test_config()), requests)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&BroadcastEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        (count, move |_: &BroadcastEvent| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn connects_and_routes_frames() {
        let (manager, mut requests) = manager();
        manager.connect(test_config().connect_options());
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let request = requests.recv().await.unwrap();
        assert_eq!(request.options.client_type, "dashboard");
        let mut server = request.accept();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        let (count, listener) = counter();
        let _guard = manager.subscribe_room("room:a", listener);
        let commands = server.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].action, Action::Join);

        let mut responses = manager.command_responses();
        server.push(json!({"roomId": "room:a", "eventType": "STATE_UPDATE", "data": {"n": 1}}));
        server.push(json!({"roomId": "room:b", "eventType": "STATE_UPDATE", "data": {"n": 2}}));
        server.push(json!({"status": "joined", "room": "room:a"}));
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let response = responses.try_recv().unwrap();
        assert_eq!(response.status, "joined");
        assert!(response.is_success());
        assert_eq!(manager.stats().frames_received, 3);
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_active() {
        let (manager, mut requests) = manager();
        manager.connect(test_config().connect_options());
        manager.connect(test_config().connect_options());
        let _server = requests.recv().await.unwrap().accept();
        settle().await;

        manager.connect(test_config().connect_options());
        settle().await;
        assert!(requests.try_recv().is_err());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_reconnecting_keeps_a_single_retry_timer() {
        let (manager, mut requests) = manager();
        manager.connect(test_config().connect_options());
        requests.recv().await.unwrap().fail("connection refused");
        let state = wait_for_state(&manager, |state| matches!(state, ConnectionState::Reconnecting { .. })).await;
        assert_eq!(state, ConnectionState::Reconnecting { attempt: 1 });

        let waiting = tokio::time::Instant::now();
        for _ in 0..3 {
            manager.connect(test_config().connect_options());
        }
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });

        // Only the backoff timer may produce the next open.
        let retry = requests.recv().await.unwrap();
        assert!(waiting.elapsed() >= Duration::from_millis(100));
        assert!(requests.try_recv().is_err());
        retry.fail("connection refused");
        wait_for_state(&manager, |state| *state == ConnectionState::Reconnecting { attempt: 2 }).await;

        let waiting = tokio::time::Instant::now();
        manager.connect(test_config().connect_options());
        manager.connect(test_config().connect_options());
        let retry = requests.recv().await.unwrap();
        assert!(waiting.elapsed() >= Duration::from_millis(200));
        let _server = retry.accept();
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(requests.try_recv().is_err());
        assert_eq!(manager.stats().reconnects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoins_every_room_after_a_drop() {
        let (manager, mut requests) = manager();
        manager.connect(test_config().connect_options());
        let mut server = requests.recv().await.unwrap().accept();
        settle().await;

        let (_, first) = counter();
        let (_, second) = counter();
        let (_, third) = counter();
        let _a = manager.subscribe_room("room:a", first);
        let _a2 = manager.subscribe_room("room:a", second);
        let _b = manager.subscribe_room("room:b", third);
        assert_eq!(server.commands().len(), 2);

        server.close();
        let state = wait_for_state(&manager, |state| !state.is_connected()).await;
        assert_eq!(state, ConnectionState::Reconnecting { attempt: 1 });

        let mut server = requests.recv().await.unwrap().accept();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        let mut rejoined: Vec<(Action, String)> = server
            .commands()
            .into_iter()
            .map(|command| (command.action, command.room.to_string()))
            .collect();
        rejoined.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            rejoined,
            vec![
                (Action::Join, "room:a".to_string()),
                (Action::Join, "room:b".to_string()),
            ]
        );
        assert_eq!(manager.stats().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (manager, mut requests) = manager();
        manager.connect(test_config().connect_options());

        let started = tokio::time::Instant::now();
        for _ in 0..4 {
            requests.recv().await.unwrap().fail("connection refused");
        }
        let state = wait_for_state(&manager, ConnectionState::is_error).await;
        match state {
            ConnectionState::Error { reason } => {
                assert!(reason.contains("Max reconnect attempts (3)"), "{}", reason);
            }
            other => panic!("unexpected state {:?}", other),
        }
        // 100 + 200 + 400 ms of backoff without jitter.
        assert!(started.elapsed() >= Duration::from_millis(700));

        settle().await;
        assert!(requests.try_recv().is_err());

        manager.connect(test_config().connect_options());
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(requests.recv().await.is_some());
    }

    #[tokio::test]
    async fn disconnect_keeps_rooms_for_the_next_connect() {
        let (manager, mut requests) = manager();
        manager.connect(test_config().connect_options());
        let mut server = requests.recv().await.unwrap().accept();
        settle().await;

        let (_, listener) = counter();
        let _guard = manager.subscribe_room("room:a", listener);
        server.commands();

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.rooms().active_rooms(), vec![RoomId::from("room:a")]);

        let err = manager
            .send_message(RoomId::from("room:a"), json!({"text": "hi"}))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected { .. }));
        assert_eq!(manager.stats().commands_dropped, 1);

        manager.connect(test_config().connect_options());
        let mut server = requests.recv().await.unwrap().accept();
        settle().await;
        let commands = server.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].action, Action::Join);
        assert_eq!(commands[0].room.as_str(), "room:a");
    }

    #[tokio::test]
    async fn stale_open_is_ignored_after_disconnect() {
        let (manager, mut requests) = manager();
        manager.connect(test_config().connect_options());
        let stale = requests.recv().await.unwrap();

        manager.disconnect();
        manager.connect(test_config().connect_options());
        let fresh = requests.recv().await.unwrap();

        let _stale_server = stale.accept();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let _server = fresh.accept();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn invalid_frames_are_counted_and_skipped() {
        let (manager, mut requests) = manager();
        manager.connect(test_config().connect_options());
        let server = requests.recv().await.unwrap().accept();
        settle().await;

        let (count, listener) = counter();
        let _guard = manager.subscribe_room("room:a", listener);

        server.push_raw("not json");
        server.push(json!({"hello": "world"}));
        server.push(json!({"roomId": "", "eventType": "X"}));
        server.push(json!({"roomId": "room:a", "eventType": "CHAT_MESSAGE"}));
        settle().await;

        let stats = manager.stats();
        assert_eq!(stats.protocol_errors, 3);
        assert_eq!(stats.frames_received, 4);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn reconnect_reuses_last_options() {
        let (manager, mut requests) = manager();
        assert!(!manager.reconnect());

        let options = ConnectOptions::new("ws://elsewhere.invalid/ws", "widget");
        manager.connect(options.clone());
        let _server = requests.recv().await.unwrap().accept();
        settle().await;

        assert!(manager.reconnect());
        let request = requests.recv().await.unwrap();
        assert_eq!(request.options, options);
    }

    #[tokio::test]
    async fn observers_see_each_transition() {
        let (manager, mut requests) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let id = manager.add_observer(Arc::new(move |state: &ConnectionState| {
            log.lock().unwrap().push(state.clone());
        }));

        manager.connect(test_config().connect_options());
        let _server = requests.recv().await.unwrap().accept();
        settle().await;
        manager.remove_observer(id);
        manager.disconnect();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[ConnectionState::Connecting, ConnectionState::Connected]
        );
    }
}
