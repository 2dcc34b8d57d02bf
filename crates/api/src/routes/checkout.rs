//! Checkout session endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use checkout::{CartLine, CheckoutOutcome, CheckoutRequest, PaymentStatus, Quote};
use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, Money, OrderId};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::{AppState, Store};

// -- Request types --

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub items: Vec<CartLine>,
    pub holder_id: HolderId,
    #[serde(default)]
    pub customer_email: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreatedResponse {
    pub session_id: CheckoutSessionId,
    pub redirect_url: String,
    pub reserved_until: DateTime<Utc>,
    pub amount: Quote,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: CheckoutSessionId,
    pub payment_status: PaymentStatus,
    pub customer_email: Option<String>,
    pub amount_total: Option<Money>,
    pub order_id: Option<OrderId>,
}

// -- Handlers --

/// POST /api/checkout/sessions: reserve the cart and open a payment session.
#[tracing::instrument(skip(state, req), fields(holder = %req.holder_id, item_count = req.items.len()))]
pub async fn create<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionCreatedResponse>, ApiError> {
    let request = CheckoutRequest {
        holder: req.holder_id,
        lines: req.items,
        customer_email: req.customer_email,
    };

    match state.coordinator.begin_checkout(request).await? {
        CheckoutOutcome::Created {
            session_id,
            redirect_url,
            reserved_until,
            quote,
        } => Ok(Json(SessionCreatedResponse {
            session_id,
            redirect_url,
            reserved_until,
            amount: quote,
        })),
        CheckoutOutcome::Unavailable { unavailable_ids } => {
            Err(ApiError::Unavailable(unavailable_ids))
        }
    }
}

/// GET /api/checkout/sessions/:id: payment status for the confirmation page.
#[tracing::instrument(skip(state))]
pub async fn verify<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let verification = state
        .coordinator
        .verify_session(&CheckoutSessionId::new(id))
        .await?;

    Ok(Json(SessionStatusResponse {
        session_id: verification.session_id,
        payment_status: verification.payment_status,
        customer_email: verification.customer_email,
        amount_total: verification.amount_total,
        order_id: verification.order_id,
    }))
}
