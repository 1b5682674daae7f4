//! Native WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{ConnectOptions, Connector, Link, TransportError};

/// Opens WebSocket connections and pumps text frames between the socket and
/// the [`Link`] channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn open(&self, options: &ConnectOptions) -> Result<Link, TransportError> {
        let url = options.endpoint()?;
        crate::log_info!("Opening WebSocket to {}", url);

        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        // Spawn read task
        let host_for_read = url.host_str().unwrap_or_default().to_string();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.as_str().to_owned()).is_err() {
                            // Link dropped by the manager
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        crate::log_info!("WebSocket to {} received close frame", host_for_read);
                        break;
                    }
                    Ok(Message::Ping(data)) => {
                        // Pong is handled automatically by tungstenite
                        crate::log_debug!("Received ping: {:?}", data);
                    }
                    Ok(_) => {
                        // Ignore binary, pong, etc.
                    }
                    Err(e) => {
                        crate::log_error!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
        });

        // Spawn write task
        let host_for_write = url.host_str().unwrap_or_default().to_string();
        tokio::spawn(async move {
            while let Some(json) = outbound_rx.recv().await {
                crate::log_debug!("Sending to {}: {}", host_for_write, json);
                if let Err(e) = write.send(Message::text(json)).await {
                    crate::log_error!("Send failed: {}", e);
                    break;
                }
            }
            // Sender dropped: close our side of the socket
            let _ = write.close().await;
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
