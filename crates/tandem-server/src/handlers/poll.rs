//! Poll and reset endpoints.

use super::{header, AppState};
use crate::error::ApiError;
use crate::metrics;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use tandem_core::{reconcile, require_room, AccessRequest, PollOutcome};
use tandem_protocol::headers::{CAN_EDIT, USER_ID};
use tandem_protocol::{PollRequest, PollResponse, ResetResponse, RoomQuery};
use tracing::{debug, info};

/// Reconcile a client's snapshot with the room's document.
///
/// The room is checked before the body. A missing or unreadable body is
/// treated as a poll without a snapshot; only an oversized one is refused.
pub async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
    headers: HeaderMap,
    body: Result<Json<PollRequest>, JsonRejection>,
) -> Result<Json<PollResponse>, ApiError> {
    let room = require_room(&query)?;
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            metrics::record_rejected("poll_too_large");
            return Err(ApiError::PayloadTooLarge(rejection.body_text()));
        }
        Err(rejection) => {
            debug!(room = %room, error = %rejection, "Poll without a readable body");
            PollRequest::default()
        }
    };
    let grant = state
        .policy
        .grant(AccessRequest {
            room,
            can_edit: header(&headers, CAN_EDIT),
            user_id: header(&headers, USER_ID),
        })
        .await;

    let reconciled = reconcile(&state.store, &grant, &request).await;
    let outcome = match reconciled.outcome {
        PollOutcome::Unchanged => "unchanged",
        PollOutcome::Returned => "returned",
        PollOutcome::Merged => "merged",
        PollOutcome::Created => "created",
    };
    if matches!(reconciled.outcome, PollOutcome::Merged | PollOutcome::Created) {
        metrics::record_merge("poll");
        metrics::set_active_documents(state.store.len());
    }
    metrics::record_poll(outcome);
    debug!(room = %room, can_edit = grant.can_edit, outcome, "Poll reconciled");

    Ok(Json(reconciled.response))
}

/// Close the live sessions of a room, optionally only one user's.
pub async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
    headers: HeaderMap,
) -> Result<Json<ResetResponse>, ApiError> {
    let room = require_room(&query)?;
    let user_id = header(&headers, USER_ID).filter(|u| !u.is_empty());

    let closed = state.store.reset(room, user_id);
    info!(room = %room, user = ?user_id, closed, "Reset live sessions");

    Ok(Json(ResetResponse { closed }))
}
