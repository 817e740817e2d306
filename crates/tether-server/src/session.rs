//! WebSocket session lifecycle: one controller client from upgrade to disconnect.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tether_core::ClientId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::bridge::ControllerBridge;
use crate::connection::ClientConnection;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Run a session for a connected controller client.
///
/// 1. Registers the connection with the bridge
/// 2. Forwards outbound frames through a writer task
/// 3. Feeds inbound text frames to [`ControllerBridge::handle_message`]
/// 4. Unregisters on close, transport error, shutdown, or bridge close
#[instrument(skip_all, fields(client_id = %client_id))]
pub async fn run_controller_session(
    ws: WebSocket,
    client_id: ClientId,
    bridge: Arc<ControllerBridge>,
    shutdown: CancellationToken,
    outbound_buffer: usize,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(outbound_buffer);
    let connection = Arc::new(ClientConnection::new(client_id.clone(), send_tx));

    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    let _ = bridge.on_connect(Arc::clone(&connection));

    let outbound = tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let closed = bridge.closed_token();
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t.to_string(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => {
                            debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        info!("client sent close frame");
                        break;
                    }
                    Some(Err(err)) => {
                        info!(error = %err, "transport error");
                        break;
                    }
                    None => break,
                };
                bridge.handle_message(&client_id, &text);
            }
            () = shutdown.cancelled() => break,
            () = closed.cancelled() => break,
        }
    }

    bridge.on_disconnect(&client_id);
    outbound.abort();
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(
        dropped = connection.drop_count(),
        secs = started.elapsed().as_secs(),
        "controller client disconnected"
    );
}
