//! Reservation error types.

use item_store::StoreError;
use thiserror::Error;

/// Errors that can occur during reservation operations.
///
/// An item that cannot be reserved is not an error; it is reported in
/// [`ReserveOutcome::unavailable`](crate::ReserveOutcome::unavailable).
#[derive(Debug, Error)]
pub enum ReservationError {
    /// The request carried no holder identity.
    #[error("Holder id must not be empty")]
    MissingHolder,

    /// The hold duration is zero or negative.
    #[error("Hold TTL must be positive, got {0} seconds")]
    InvalidTtl(i64),

    /// An error occurred in the item store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for reservation operations.
pub type Result<T> = std::result::Result<T, ReservationError>;
