//! Live collaboration WebSocket.

use super::{header, AppState};
use crate::error::ApiError;
use crate::metrics::{self, gateway, ConnectionMetricsGuard};
use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Path, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tandem_core::{
    require_room, verify_room_identity, AccessRequest, ConnectionId, Forward, LiveSession,
};
use tandem_protocol::headers::{CAN_EDIT, USER_ID};
use tandem_protocol::RoomQuery;
use tracing::{debug, trace, warn};

/// WebSocket upgrade handler.
///
/// The room is checked against the document name in the path before the
/// upgrade, so a mismatch is answered with a plain `401`.
pub async fn ws_handler(
    Path(doc_name): Path<String>,
    Query(query): Query<RoomQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let room = require_room(&query).map_err(|e| {
        metrics::record_rejected("missing_room");
        e
    })?;
    verify_room_identity(room, &doc_name).map_err(|e| {
        metrics::record_rejected("room_mismatch");
        e
    })?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let grant = state
        .policy
        .grant(AccessRequest {
            room,
            can_edit: header(&headers, CAN_EDIT),
            user_id: header(&headers, USER_ID),
        })
        .await;
    let session = LiveSession::bind(&state.store, &doc_name, grant, ConnectionId::generate())?;
    metrics::set_active_documents(state.store.len());

    Ok(ws
        .max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, session))
        .into_response())
}

/// Handle a bound live session.
async fn handle_websocket(socket: WebSocket, mut session: LiveSession) {
    let _metrics_guard = ConnectionMetricsGuard::new(gateway::LIVE);
    let connection_id = session.id().clone();
    let (mut sender, mut receiver) = socket.split();

    let greeting = session.greeting().await;
    if sender.send(Message::Binary(greeting.to_vec())).await.is_err() {
        warn!(connection = %connection_id, "Failed to send sync step 1");
        return;
    }

    loop {
        tokio::select! {
            event = session.next_event() => {
                match event {
                    Some(Forward::Frame(frame)) => {
                        metrics::record_message(gateway::LIVE, frame.len(), "outbound");
                        if sender.send(Message::Binary(frame.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Forward::Close) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: "reset".into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_message(gateway::LIVE, data.len(), "inbound");
                        match session.handle_frame(&data).await {
                            Ok(Some(reply)) => {
                                metrics::record_message(gateway::LIVE, reply.len(), "outbound");
                                if sender.send(Message::Binary(reply.to_vec())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Dropping frame");
                                metrics::record_error("sync");
                            }
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        trace!(connection = %connection_id, "Ignoring text frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
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

    session.close();
}
