//! Order history.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId, Money, OrderId};
use item_store::{OrderLine, OrderRecord, OrderStore};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::{AppState, Store};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersQuery {
    pub holder_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: OrderId,
    pub checkout_session_id: CheckoutSessionId,
    pub user_id: HolderId,
    pub customer_email: Option<String>,
    pub items: Vec<OrderLineResponse>,
    pub subtotal: Money,
    pub amount_paid: Option<Money>,
    pub payment_reference: Option<String>,
    pub unfulfilled_item_ids: Vec<ItemId>,
    pub needs_reconciliation: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineResponse {
    pub item_id: ItemId,
    pub title: String,
    pub price: Money,
}

impl From<OrderLine> for OrderLineResponse {
    fn from(line: OrderLine) -> Self {
        Self {
            item_id: line.item_id,
            title: line.title,
            price: line.price,
        }
    }
}

impl From<OrderRecord> for OrderResponse {
    fn from(order: OrderRecord) -> Self {
        Self {
            order_id: order.order_id,
            checkout_session_id: order.checkout_session_id,
            user_id: order.user_id,
            customer_email: order.customer_email,
            items: order.lines.into_iter().map(Into::into).collect(),
            subtotal: order.subtotal,
            amount_paid: order.amount_paid,
            payment_reference: order.payment_reference,
            unfulfilled_item_ids: order.unfulfilled_item_ids,
            needs_reconciliation: order.needs_reconciliation,
            created_at: order.created_at,
        }
    }
}

/// GET /api/orders?holderId=x: a user's orders, newest first.
#[tracing::instrument(skip(state, query))]
pub async fn list<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<Vec<OrderResponse>>, ApiError> {
    let holder = HolderId::new(query.holder_id);
    if holder.is_blank() {
        return Err(ApiError::BadRequest("holderId is required".to_string()));
    }

    let orders = state.engine.store().list_orders_for_user(&holder).await?;
    Ok(Json(orders.into_iter().map(Into::into).collect()))
}
