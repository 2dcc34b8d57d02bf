//! Catalog reads and availability checks.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use common::{HolderId, ItemId, Money};
use item_store::{Disposition, ItemRecord};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::{AppState, Store};

// -- Request types --

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityQuery {
    /// Comma-separated item ids.
    pub ids: String,
    #[serde(default)]
    pub holder_id: Option<String>,
}

// -- Response types --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResponse {
    pub id: ItemId,
    pub title: String,
    pub price: Money,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sold_at: Option<DateTime<Utc>>,
}

impl ItemResponse {
    /// Reports a lapsed hold as available.
    pub fn at(item: ItemRecord, now: DateTime<Utc>) -> Self {
        let lapsed = item.hold_expired(now);
        Self {
            id: item.id,
            title: item.title,
            price: item.price,
            disposition: if lapsed {
                Disposition::Available
            } else {
                item.disposition
            },
            reserved_until: if lapsed { None } else { item.reserved_until },
            sold_at: item.sold_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub unavailable_ids: Vec<ItemId>,
}

// -- Handlers --

/// GET /api/items: items anyone could reserve right now.
#[tracing::instrument(skip(state, query))]
pub async fn list<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ItemResponse>>, ApiError> {
    let now = state.engine.now();
    let items = state.engine.list_free(query.limit, query.offset).await?;
    Ok(Json(
        items
            .into_iter()
            .map(|item| ItemResponse::at(item, now))
            .collect(),
    ))
}

/// GET /api/items/:id: one item with its disposition.
#[tracing::instrument(skip(state))]
pub async fn get<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<ItemResponse>, ApiError> {
    let item = state
        .engine
        .get_item(&ItemId::new(id.as_str()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Item {id} not found")))?;

    Ok(Json(ItemResponse::at(item, state.engine.now())))
}

/// GET /api/items/availability?ids=a,b&holderId=x: which of the ids the
/// holder could not reserve.
#[tracing::instrument(skip(state, query))]
pub async fn availability<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let ids = split_ids(&query.ids);
    if ids.is_empty() {
        return Err(ApiError::BadRequest("ids must not be empty".to_string()));
    }
    let holder = HolderId::new(query.holder_id.unwrap_or_default());

    let unavailable_ids = state.engine.unavailable_for(&ids, &holder).await?;
    Ok(Json(AvailabilityResponse { unavailable_ids }))
}

fn split_ids(raw: &str) -> Vec<ItemId> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ItemId::new)
        .collect()
}
