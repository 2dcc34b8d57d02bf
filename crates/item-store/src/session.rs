//! Mapping from a provider checkout session to the reservation it pays for.

use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId, Money};
use serde::{Deserialize, Serialize};

/// What the payment-completion handler needs to find a session's hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSessionRecord {
    pub session_id: CheckoutSessionId,
    pub holder: HolderId,
    pub item_ids: Vec<ItemId>,
    pub amount: Money,
    pub reserved_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
