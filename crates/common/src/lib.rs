//! Shared types for the reservation service.

pub mod clock;
pub mod money;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use money::Money;
pub use types::{CheckoutSessionId, HolderId, ItemId, OrderId};
