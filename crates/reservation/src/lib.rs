//! Reservation layer for one-of-a-kind items.
//!
//! This crate provides:
//! - [`ReservationEngine`]: try-reserve / release / commit over an
//!   [`ItemStore`](item_store::ItemStore), each item moved by a single
//!   conditional update
//! - [`ExpirySweeper`]: the recurring set-based release of lapsed holds

pub mod engine;
pub mod error;
pub mod sweeper;

pub use engine::{CommitOutcome, ReservationEngine, ReserveOutcome};
pub use error::{ReservationError, Result};
pub use sweeper::ExpirySweeper;
