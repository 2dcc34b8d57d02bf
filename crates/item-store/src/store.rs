use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId};

use crate::{CheckoutSessionRecord, InsertOutcome, ItemQuery, ItemRecord, NewItem, OrderRecord, Result};

/// Durable record of every unique item and its disposition.
///
/// The transition methods are conditional updates: each one checks the
/// item's current state and writes the new state as a single atomic step.
/// A transition whose guard does not match changes nothing and reports that
/// fact through its return value rather than an error. Callers must never
/// emulate a transition with [`get_item`](ItemStore::get_item) followed by a
/// write.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Creates an item, or refreshes the catalog fields (title, price) of an
    /// existing one. Never touches disposition or hold fields.
    async fn upsert_item(&self, item: NewItem, now: DateTime<Utc>) -> Result<ItemRecord>;

    /// Retrieves a single item.
    async fn get_item(&self, id: &ItemId) -> Result<Option<ItemRecord>>;

    /// Retrieves items matching a query.
    async fn query_items(&self, query: ItemQuery) -> Result<Vec<ItemRecord>>;

    /// `Reserved` by `holder` until `until`, provided the item is available,
    /// already held by `holder`, or held by anyone with a deadline before
    /// `now`.
    ///
    /// Returns the updated item, or None if the guard did not match (including
    /// when the item does not exist).
    async fn reserve_item(
        &self,
        id: &ItemId,
        holder: &HolderId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<ItemRecord>>;

    /// `Reserved` by `holder` → `Available`.
    ///
    /// Returns true if the item was released.
    async fn release_item(&self, id: &ItemId, holder: &HolderId) -> Result<bool>;

    /// `Reserved` by `holder` with `reserved_until <= until` → `Available`.
    ///
    /// Leaves alone a hold the same holder refreshed past `until`. Returns
    /// true if the item was released.
    async fn release_item_if_until(
        &self,
        id: &ItemId,
        holder: &HolderId,
        until: DateTime<Utc>,
    ) -> Result<bool>;

    /// `Reserved` by `holder` → `Sold` to `buyer`, stamping `sold_at = now`
    /// and the paying checkout session, if any.
    ///
    /// Returns the sold item, or None if `holder` did not hold it.
    async fn commit_item(
        &self,
        id: &ItemId,
        holder: &HolderId,
        buyer: &str,
        session_id: Option<&CheckoutSessionId>,
        now: DateTime<Utc>,
    ) -> Result<Option<ItemRecord>>;

    /// Set-based release of every hold whose deadline is before `now`.
    ///
    /// Returns the number of items made available. Safe to run concurrently
    /// with itself and with every other transition.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Orders keyed by the checkout session that paid for them.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Stores `order` unless an order for the same checkout session exists.
    async fn insert_order_if_absent(&self, order: OrderRecord) -> Result<InsertOutcome>;

    /// Looks up the order produced by a checkout session.
    async fn get_order_by_session(
        &self,
        session_id: &CheckoutSessionId,
    ) -> Result<Option<OrderRecord>>;

    /// Lists a user's orders, newest first.
    async fn list_orders_for_user(&self, user_id: &HolderId) -> Result<Vec<OrderRecord>>;
}

/// Checkout-session → reservation mapping used by the webhook handler.
#[async_trait]
pub trait CheckoutSessionStore: Send + Sync {
    /// Saves the mapping. Saving the same session id again replaces it.
    async fn save_session(&self, session: CheckoutSessionRecord) -> Result<()>;

    /// Retrieves the mapping for a session.
    async fn get_session(
        &self,
        session_id: &CheckoutSessionId,
    ) -> Result<Option<CheckoutSessionRecord>>;
}

/// Extension trait providing convenience methods for item stores.
#[async_trait]
pub trait ItemStoreExt: ItemStore {
    /// Retrieves the items with the given ids; unknown ids are skipped.
    async fn get_items(&self, ids: &[ItemId]) -> Result<Vec<ItemRecord>> {
        self.query_items(ItemQuery::new().ids(ids.to_vec())).await
    }

    /// Items currently held by `holder` (including lapsed holds not yet swept).
    async fn items_held_by(&self, holder: &HolderId) -> Result<Vec<ItemRecord>> {
        self.query_items(ItemQuery::held_by(holder.clone())).await
    }
}

// Blanket implementation for all ItemStore implementations
impl<T: ItemStore + ?Sized> ItemStoreExt for T {}

/// Records a conditional transition whose guard matched no row.
pub(crate) fn guard_missed(op: &'static str, id: &ItemId) {
    metrics::counter!("item_store_guard_misses_total", "op" => op).increment(1);
    tracing::debug!(op, item_id = %id, "transition guard did not match");
}
