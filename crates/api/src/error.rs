//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::CheckoutError;
use common::ItemId;
use item_store::StoreError;
use reservation::ReservationError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Some requested items are held by someone else or sold.
    Unavailable(Vec<ItemId>),
    /// Checkout error.
    Checkout(CheckoutError),
    /// Reservation error.
    Reservation(ReservationError),
    /// Storage error.
    Store(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(ids) => {
                let body = serde_json::json!({
                    "error": "some items are no longer available",
                    "unavailableIds": ids,
                });
                return (StatusCode::CONFLICT, axum::Json(body)).into_response();
            }
            ApiError::Checkout(err) => checkout_error_to_response(err),
            ApiError::Reservation(err) => reservation_error_to_response(err),
            ApiError::Store(err) => internal(err.to_string()),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn internal(msg: String) -> (StatusCode, String) {
    tracing::error!(error = %msg, "internal server error");
    (StatusCode::INTERNAL_SERVER_ERROR, msg)
}

fn checkout_error_to_response(err: CheckoutError) -> (StatusCode, String) {
    match err {
        CheckoutError::InvalidCart(_) | CheckoutError::Signature(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        CheckoutError::SessionNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        CheckoutError::Provider(_) | CheckoutError::ReleaseSignal(_) => {
            tracing::warn!(error = %err, "upstream failure");
            (StatusCode::BAD_GATEWAY, err.to_string())
        }
        CheckoutError::Reservation(err) => reservation_error_to_response(err),
        CheckoutError::Store(_) | CheckoutError::Serialization(_) => internal(err.to_string()),
    }
}

fn reservation_error_to_response(err: ReservationError) -> (StatusCode, String) {
    match err {
        ReservationError::MissingHolder | ReservationError::InvalidTtl(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        ReservationError::Store(_) => internal(err.to_string()),
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError::Checkout(err)
    }
}

impl From<ReservationError> for ApiError {
    fn from(err: ReservationError) -> Self {
        ApiError::Reservation(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}
