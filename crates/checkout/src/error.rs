//! Checkout error types.

use common::CheckoutSessionId;
use item_store::StoreError;
use reservation::ReservationError;
use thiserror::Error;

use crate::signature::SignatureError;

/// Errors that can occur during checkout operations.
///
/// Unavailable items are not errors; they are reported through
/// [`CheckoutOutcome::Unavailable`](crate::CheckoutOutcome::Unavailable).
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The cart cannot be checked out as submitted.
    #[error("Invalid cart: {0}")]
    InvalidCart(String),

    /// The payment provider failed or was unreachable. Retryable.
    #[error("Payment provider error: {0}")]
    Provider(String),

    /// No checkout session with this id is known to the provider.
    #[error("Checkout session not found: {0}")]
    SessionNotFound(CheckoutSessionId),

    /// The webhook failed its authenticity check.
    #[error("Webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),

    /// A release signal could not be delivered.
    #[error("Release signal failed: {0}")]
    ReleaseSignal(String),

    /// Reservation error.
    #[error("Reservation error: {0}")]
    Reservation(#[from] ReservationError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckoutError {
    /// True for failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckoutError::Provider(_) | CheckoutError::Store(_))
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;
