//! Reserve, release and inspect holds.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use checkout::{BatchReservation, ReleaseRequest};
use chrono::{DateTime, Utc};
use common::{HolderId, ItemId};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::items::ItemResponse;
use crate::state::{AppState, Store};

// -- Request types --

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub item_ids: Vec<ItemId>,
    pub holder_id: HolderId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderQuery {
    pub holder_id: String,
}

// -- Response types --

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservedResponse {
    pub reserved_until: DateTime<Utc>,
    pub reserved_item_ids: Vec<ItemId>,
}

#[derive(Serialize)]
pub struct ReleasedResponse {
    pub released: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldResponse {
    pub holder_id: HolderId,
    /// Earliest deadline among the held items.
    pub reserved_until: Option<DateTime<Utc>>,
    pub items: Vec<ItemResponse>,
}

// -- Handlers --

/// POST /api/reservations: hold every item for the holder, or none.
#[tracing::instrument(skip(state, req), fields(holder = %req.holder_id, item_count = req.item_ids.len()))]
pub async fn reserve<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<ReserveRequest>,
) -> Result<Json<ReservedResponse>, ApiError> {
    match state
        .coordinator
        .reserve_batch(&req.item_ids, &req.holder_id)
        .await?
    {
        BatchReservation::Held {
            items,
            reserved_until,
        } => Ok(Json(ReservedResponse {
            reserved_until,
            reserved_item_ids: items.into_iter().map(|item| item.id).collect(),
        })),
        BatchReservation::Unavailable { unavailable_ids } => {
            Err(ApiError::Unavailable(unavailable_ids))
        }
    }
}

/// POST /api/reservations/release: give back the holder's items.
///
/// Releasing is idempotent, so a request that names nothing releasable
/// (unreadable body, blank holder) is acknowledged with `released: 0`.
#[tracing::instrument(skip(state, body))]
pub async fn release<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> Result<Json<ReleasedResponse>, ApiError> {
    let Some(req) = read_release(&body) else {
        return Ok(Json(ReleasedResponse { released: 0 }));
    };

    let released = state.engine.release(&req.item_ids, &req.holder_id).await?;
    Ok(Json(ReleasedResponse { released }))
}

/// POST /api/reservations/release-beacon: release sent while a page
/// unloads. Beacons arrive as text/plain and nobody reads the reply, so this
/// always answers 204.
#[tracing::instrument(skip(state, body))]
pub async fn release_beacon<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> StatusCode {
    metrics::counter!("reservation_release_beacons_total").increment(1);

    let Some(req) = read_release(&body) else {
        return StatusCode::NO_CONTENT;
    };

    if let Err(e) = state.engine.release(&req.item_ids, &req.holder_id).await {
        tracing::warn!(error = %e, holder = %req.holder_id, "release beacon failed");
    }
    StatusCode::NO_CONTENT
}

/// Parses a release body; None when it cannot name anything to release.
fn read_release(body: &[u8]) -> Option<ReleaseRequest> {
    let req: ReleaseRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unreadable release request");
            return None;
        }
    };
    if req.holder_id.is_blank() {
        tracing::debug!("ignoring release request without a holder");
        return None;
    }
    Some(req)
}

/// GET /api/reservations?holderId=x: the holder's live holds.
#[tracing::instrument(skip(state, query))]
pub async fn held<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<HolderQuery>,
) -> Result<Json<HeldResponse>, ApiError> {
    let holder = HolderId::new(query.holder_id);
    if holder.is_blank() {
        return Err(ApiError::BadRequest("holderId is required".to_string()));
    }

    let now = state.engine.now();
    let items = state.engine.held_by(&holder).await?;
    let reserved_until = items.iter().filter_map(|item| item.reserved_until).min();

    Ok(Json(HeldResponse {
        holder_id: holder,
        reserved_until,
        items: items
            .into_iter()
            .map(|item| ItemResponse::at(item, now))
            .collect(),
    }))
}
