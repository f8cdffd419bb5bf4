//! Signaling WebSocket.
//!
//! Each socket is registered with the relay, gets its own heartbeat task and
//! drains an outbound queue the relay writes into. Teardown always goes
//! through [`tandem_core::Relay::disconnect`].

use super::AppState;
use crate::metrics::{self, gateway, ConnectionMetricsGuard};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        OriginalUri, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tandem_core::{Handled, Outbound};
use tracing::{debug, trace, warn};

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    OriginalUri(uri): OriginalUri,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    // Peers only see each other when they connected to the same URI.
    let origin = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, origin, state))
}

/// Convert a queued frame into a WebSocket message.
fn to_message(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Binary(data) => Message::Binary(data.to_vec()),
        Outbound::Ping => Message::Ping(Vec::new()),
        Outbound::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

/// Handle a signaling connection.
async fn handle_websocket(socket: WebSocket, origin: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new(gateway::SIGNALING);
    let relay = Arc::clone(&state.relay);

    let (handle, mut outbound) = relay.connect(origin);
    let connection_id = handle.id().clone();
    let heartbeat = relay.spawn_heartbeat(connection_id.clone());

    debug!(connection = %connection_id, origin = %handle.origin(), "Signaling connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            queued = outbound.recv() => {
                let Some(queued) = queued else { break };
                let closing = matches!(queued, Outbound::Close(_));
                let message = to_message(queued);
                if let Message::Text(text) = &message {
                    metrics::record_message(gateway::SIGNALING, text.len(), "outbound");
                }
                if sender.send(message).await.is_err() || closing {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message(gateway::SIGNALING, text.len(), "inbound");
                        match relay.handle_text(&handle, &text) {
                            Handled::Subscribed(_) | Handled::Unsubscribed(_) => {
                                metrics::set_active_topics(relay.broker().stats().topic_count);
                            }
                            handled => {
                                trace!(connection = %connection_id, handled = ?handled, "Frame handled");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        trace!(connection = %connection_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        relay.mark_alive(&connection_id);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        relay.mark_alive(&connection_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    heartbeat.abort();
    relay.disconnect(&connection_id, None);
    metrics::set_active_topics(relay.broker().stats().topic_count);

    debug!(connection = %connection_id, "Signaling disconnected");
}
