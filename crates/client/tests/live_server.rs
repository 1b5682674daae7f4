use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roomlink_client::ws::ReconnectConfig;
use roomlink_client::{ClientConfig, ConnectionManager, ConnectionState, Dedup, Handlers};
use roomlink_shared::{BroadcastEvent, RoomId};
use serde_json::json;

const ROOM: &str = "agents:notifications:ws1:bot1";

async fn start_server() -> SocketAddr {
    let state = roomlink_server::AppState::new(&roomlink_server::ServerConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(roomlink_server::serve(listener, state));
    addr
}

fn config_for(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        url: format!("ws://{}/ws", addr),
        client_type: "dashboard".to_string(),
        reconnect: ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 50,
            max_delay_ms: 200,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        },
        leave_grace: Duration::ZERO,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn two_clients_exchange_events_through_the_broker() {
    let addr = start_server().await;
    let config = config_for(addr);

    let dashboard = ConnectionManager::new(&config);
    let agent = ConnectionManager::new(&config);
    dashboard.connect(config.connect_options());
    agent.connect(config.connect_options());

    let received: Arc<Mutex<Vec<BroadcastEvent>>> = Arc::default();
    let banners = Arc::new(Mutex::new(0usize));

    let log = Arc::clone(&received);
    let feed = dashboard.subscribe(
        ROOM,
        true,
        Handlers::new().on_message(move |event| {
            log.lock().unwrap().push(event.clone());
            Ok(())
        }),
    );
    let shown = Arc::clone(&banners);
    let banner = Dedup::by_fields("escalationId", "conversationId", move |_event: &BroadcastEvent| {
        *shown.lock().unwrap() += 1;
        Ok(())
    });
    let _banner = dashboard.subscribe(ROOM, true, Handlers::new().on_message(banner.into_handler()));

    eventually(|| feed.connection_state() == ConnectionState::Connected).await;
    eventually(|| agent.state().is_connected()).await;

    let mut responses = dashboard.command_responses();
    dashboard.request_stats(RoomId::from(ROOM)).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let response = responses.recv().await.unwrap();
            if response.extra.contains_key("subscribers") {
                return response;
            }
        }
    })
    .await
    .unwrap();
    // Two local subscriptions, one server-side join.
    assert_eq!(stats.extra["subscribers"], 1);

    let escalation = json!({"eventType": "NEW_ESCALATION", "escalationId": "e1"});
    agent.send_message(RoomId::from(ROOM), escalation.clone()).unwrap();
    agent.send_message(RoomId::from(ROOM), escalation).unwrap();

    eventually(|| received.lock().unwrap().len() == 2).await;
    assert_eq!(received.lock().unwrap()[0].event_type, "NEW_ESCALATION");
    assert_eq!(*banners.lock().unwrap(), 1);

    dashboard.disconnect();
    agent.disconnect();
}

#[tokio::test]
async fn unreachable_server_ends_in_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = config_for(addr);
    config.reconnect.max_attempts = 2;
    let manager = ConnectionManager::new(&config);
    let mut states = manager.watch_state();
    manager.connect(config.connect_options());

    let state = tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(ConnectionState::is_error),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert!(matches!(state, ConnectionState::Error { .. }));
    assert_eq!(manager.stats().reconnects, 2);
}
