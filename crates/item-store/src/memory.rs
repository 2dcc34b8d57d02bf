use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId};
use tokio::sync::RwLock;

use crate::{
    CheckoutSessionRecord, InsertOutcome, ItemQuery, ItemRecord, NewItem, OrderRecord, Result,
    store::{CheckoutSessionStore, ItemStore, OrderStore, guard_missed},
};

/// In-memory store implementation.
///
/// Provides the same interface and the same atomicity guarantees as the
/// PostgreSQL implementation: every conditional transition evaluates its guard
/// and applies its update while holding the items write lock.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    items: Arc<RwLock<HashMap<ItemId, ItemRecord>>>,
    orders: Arc<RwLock<HashMap<CheckoutSessionId, OrderRecord>>>,
    sessions: Arc<RwLock<HashMap<CheckoutSessionId, CheckoutSessionRecord>>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of items stored.
    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }

    /// Returns the total number of orders stored.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Clears all items, orders and sessions.
    pub async fn clear(&self) {
        self.items.write().await.clear();
        self.orders.write().await.clear();
        self.sessions.write().await.clear();
    }
}

#[async_trait]
impl ItemStore for InMemoryStore {
    async fn upsert_item(&self, item: NewItem, now: DateTime<Utc>) -> Result<ItemRecord> {
        let mut items = self.items.write().await;
        let record = match items.get_mut(&item.id) {
            Some(existing) => {
                existing.title = item.title;
                existing.price = item.price;
                existing.clone()
            }
            None => {
                let record = ItemRecord::from_new(item, now);
                items.insert(record.id.clone(), record.clone());
                record
            }
        };
        Ok(record)
    }

    async fn get_item(&self, id: &ItemId) -> Result<Option<ItemRecord>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn query_items(&self, query: ItemQuery) -> Result<Vec<ItemRecord>> {
        let items = self.items.read().await;
        let mut matched: Vec<_> = items.values().filter(|i| query.matches(i)).cloned().collect();

        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let offset = query.offset.unwrap_or(0);
        let matched = matched.into_iter().skip(offset);
        Ok(match query.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        })
    }

    async fn reserve_item(
        &self,
        id: &ItemId,
        holder: &HolderId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<ItemRecord>> {
        let mut items = self.items.write().await;
        match items.get_mut(id) {
            Some(item) if item.is_reservable_by(holder, now) => {
                item.reserve(holder, now, until);
                Ok(Some(item.clone()))
            }
            _ => {
                guard_missed("reserve", id);
                Ok(None)
            }
        }
    }

    async fn release_item(&self, id: &ItemId, holder: &HolderId) -> Result<bool> {
        let mut items = self.items.write().await;
        match items.get_mut(id) {
            Some(item) if item.is_held_by(holder) => {
                item.make_available();
                Ok(true)
            }
            _ => {
                guard_missed("release", id);
                Ok(false)
            }
        }
    }

    async fn release_item_if_until(
        &self,
        id: &ItemId,
        holder: &HolderId,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut items = self.items.write().await;
        match items.get_mut(id) {
            Some(item) if item.is_held_by_until(holder, until) => {
                item.make_available();
                Ok(true)
            }
            _ => {
                guard_missed("release_until", id);
                Ok(false)
            }
        }
    }

    async fn commit_item(
        &self,
        id: &ItemId,
        holder: &HolderId,
        buyer: &str,
        session_id: Option<&CheckoutSessionId>,
        now: DateTime<Utc>,
    ) -> Result<Option<ItemRecord>> {
        let mut items = self.items.write().await;
        match items.get_mut(id) {
            Some(item) if item.is_held_by(holder) => {
                item.sell(buyer, session_id, now);
                Ok(Some(item.clone()))
            }
            _ => {
                guard_missed("commit", id);
                Ok(None)
            }
        }
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut items = self.items.write().await;
        let mut released = 0;
        for item in items.values_mut().filter(|i| i.hold_expired(now)) {
            item.make_available();
            released += 1;
        }
        tracing::debug!(released, "released lapsed holds");
        Ok(released)
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_order_if_absent(&self, order: OrderRecord) -> Result<InsertOutcome> {
        let mut orders = self.orders.write().await;
        if let Some(existing) = orders.get(&order.checkout_session_id) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        orders.insert(order.checkout_session_id.clone(), order.clone());
        Ok(InsertOutcome::Inserted(order))
    }

    async fn get_order_by_session(
        &self,
        session_id: &CheckoutSessionId,
    ) -> Result<Option<OrderRecord>> {
        Ok(self.orders.read().await.get(session_id).cloned())
    }

    async fn list_orders_for_user(&self, user_id: &HolderId) -> Result<Vec<OrderRecord>> {
        let orders = self.orders.read().await;
        let mut found: Vec<_> = orders
            .values()
            .filter(|o| &o.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}

#[async_trait]
impl CheckoutSessionStore for InMemoryStore {
    async fn save_session(&self, session: CheckoutSessionRecord) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &CheckoutSessionId,
    ) -> Result<Option<CheckoutSessionRecord>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }
}
