//! Order records produced by the payment-completion path.

use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId, Money, OrderId};
use serde::{Deserialize, Serialize};

/// A purchased item as captured on the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub item_id: ItemId,
    pub title: String,
    pub price: Money,
}

/// The downstream artifact of a completed checkout session.
///
/// At most one order exists per checkout session; see
/// [`OrderStore::insert_order_if_absent`](crate::OrderStore::insert_order_if_absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub checkout_session_id: CheckoutSessionId,
    pub user_id: HolderId,
    pub buyer: String,
    pub customer_email: Option<String>,
    pub lines: Vec<OrderLine>,
    pub subtotal: Money,
    /// Amount the provider reports as charged, if it told us.
    pub amount_paid: Option<Money>,
    pub payment_reference: Option<String>,
    pub fulfilled_item_ids: Vec<ItemId>,
    /// Items paid for that could not be committed (e.g. reclaimed by expiry
    /// before the payment notification arrived).
    pub unfulfilled_item_ids: Vec<ItemId>,
    pub needs_reconciliation: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The order was stored.
    Inserted(OrderRecord),
    /// An order for the same checkout session already existed; it is returned
    /// unchanged and the new one was discarded.
    AlreadyExists(OrderRecord),
}

impl InsertOutcome {
    pub fn order(&self) -> &OrderRecord {
        match self {
            InsertOutcome::Inserted(order) | InsertOutcome::AlreadyExists(order) => order,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}
