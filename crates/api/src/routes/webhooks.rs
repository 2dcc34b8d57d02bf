//! Payment provider callbacks.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use checkout::{CompletionOutcome, SIGNATURE_HEADER};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::{AppState, Store};

#[derive(Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: &'static str,
}

/// POST /api/webhooks/payments: signed provider events.
///
/// Answers 2xx for every authenticated event, including duplicates and
/// sessions it cannot match, so the provider does not retry them. Only a bad
/// signature is rejected.
#[tracing::instrument(skip_all)]
pub async fn payments<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome: CompletionOutcome = state.webhooks.handle(&body, signature).await?;

    Ok(Json(WebhookResponse {
        received: true,
        outcome: outcome.as_str(),
    }))
}
