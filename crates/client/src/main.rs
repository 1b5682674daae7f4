//! roomlink-tail - follow rooms on a roomlink server and print their events.
//!
//! Usage: `roomlink-tail <room> [<room> ...]`. Connection settings come from
//! the `ROOMLINK_*` environment variables.

use anyhow::Context;
use roomlink_client::logging::init_tracing;
use roomlink_client::{ClientConfig, ConnectionManager, Dedup, Handlers, Subscription};
use roomlink_shared::{BroadcastEvent, EventKind, NewEscalation};

fn print_event(event: &BroadcastEvent) -> anyhow::Result<()> {
    match event.kind() {
        EventKind::NewEscalation => {
            let escalation: NewEscalation = event
                .decode_data()
                .context("NEW_ESCALATION payload")?;
            println!(
                "[{}] escalation {} (conversation {}): {}",
                event.room_id,
                escalation.escalation_id,
                escalation.conversation_id.as_deref().unwrap_or("-"),
                escalation.reason.as_deref().unwrap_or("no reason given")
            );
        }
        _ => println!("[{}] {} {}", event.room_id, event.event_type, event.data),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("roomlink_client=info");

    let rooms: Vec<String> = std::env::args().skip(1).collect();
    if rooms.is_empty() {
        anyhow::bail!("usage: roomlink-tail <room> [<room> ...]");
    }

    let config = ClientConfig::from_env();
    let manager = ConnectionManager::new(&config);
    manager.connect(config.connect_options());

    let subscriptions: Vec<Subscription> = rooms
        .iter()
        .map(|room| {
            let printer = Dedup::by_fields("escalationId", "id", print_event);
            let handlers = Handlers::new()
                .on_message(printer.into_handler())
                .on_error(|error| roomlink_client::log_warn!("{}", error))
                .on_connection_state_change({
                    let room = room.clone();
                    move |state| roomlink_client::log_info!("{}: {}", room, state)
                });
            manager.subscribe(room.as_str(), true, handlers)
        })
        .collect();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    drop(subscriptions);
    match serde_json::to_string(&manager.stats()) {
        Ok(stats) => roomlink_client::log_info!("Connection stats: {}", stats),
        Err(e) => roomlink_client::log_warn!("Could not encode stats: {}", e),
    }
    manager.disconnect();
    Ok(())
}
