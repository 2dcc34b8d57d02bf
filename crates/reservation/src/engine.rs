//! The reservation state machine.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{CheckoutSessionId, Clock, HolderId, ItemId, SystemClock};
use item_store::{ItemQuery, ItemRecord, ItemStore, ItemStoreExt};

use crate::error::{ReservationError, Result};

/// Result of a batch reservation attempt.
///
/// Every distinct requested id lands in exactly one of `reserved` or
/// `unavailable`. Partial success is a normal outcome; the engine never rolls
/// back the reserved subset on its own.
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    /// Items now held by the caller.
    pub reserved: Vec<ItemRecord>,
    /// Ids that could not be reserved (held by someone else, sold, or unknown).
    pub unavailable: Vec<ItemId>,
    /// Deadline stamped on every item in `reserved`.
    pub reserved_until: DateTime<Utc>,
}

impl ReserveOutcome {
    /// True when every requested item was reserved.
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }

    /// Ids of the reserved items, in request order.
    pub fn reserved_ids(&self) -> Vec<ItemId> {
        self.reserved.iter().map(|item| item.id.clone()).collect()
    }
}

/// Result of committing a batch.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    /// Items sold by this call.
    pub committed: Vec<ItemRecord>,
    /// Ids that were no longer held by the holder and were left untouched.
    pub skipped: Vec<ItemId>,
}

impl CommitOutcome {
    /// True when fewer items were committed than requested.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    /// Ids of the committed items.
    pub fn committed_ids(&self) -> Vec<ItemId> {
        self.committed.iter().map(|item| item.id.clone()).collect()
    }
}

/// Governs the available → reserved → sold transitions of items.
///
/// The engine holds no reservation state of its own. Every fact lives in the
/// store, and every write is one of the store's conditional transitions, so
/// any number of engines (or processes) may share a store.
pub struct ReservationEngine<S: ItemStore> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: ItemStore> ReservationEngine<S> {
    /// Creates an engine reading wall-clock time.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Creates an engine with an explicit time source.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the engine's time source.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Current time according to the engine's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Attempts to reserve every id for `holder` until `now + ttl`.
    ///
    /// Each item is reserved independently: available items, items already
    /// held by `holder` (their deadline is refreshed) and items whose hold has
    /// lapsed are taken; everything else is reported unavailable. Duplicate
    /// ids are collapsed.
    ///
    /// A store error aborts the batch: the holds this call already took are
    /// released before the error is returned.
    #[tracing::instrument(skip(self, ids), fields(holder = %holder, item_count = ids.len()))]
    pub async fn try_reserve(
        &self,
        ids: &[ItemId],
        holder: &HolderId,
        ttl: Duration,
    ) -> Result<ReserveOutcome> {
        ensure_holder(holder)?;
        if ttl <= Duration::zero() {
            return Err(ReservationError::InvalidTtl(ttl.num_seconds()));
        }

        metrics::counter!("reservation_attempts_total").increment(1);

        let now = self.now();
        let reserved_until = now + ttl;
        let mut reserved = Vec::new();
        let mut unavailable = Vec::new();

        for id in distinct(ids) {
            match self.store.reserve_item(&id, holder, now, reserved_until).await {
                Ok(Some(item)) => reserved.push(item),
                Ok(None) => unavailable.push(id),
                Err(e) => {
                    tracing::error!(error = %e, item_id = %id, "reserve failed; undoing batch");
                    // The failed write may still have landed.
                    let mut taken: Vec<ItemId> = reserved.iter().map(|item| item.id.clone()).collect();
                    taken.push(id);
                    self.undo_reserve(&taken, holder).await;
                    return Err(e.into());
                }
            }
        }

        if !unavailable.is_empty() {
            metrics::counter!("reservation_conflicts_total").increment(unavailable.len() as u64);
            tracing::info!(
                reserved = reserved.len(),
                unavailable = unavailable.len(),
                "reservation conflict"
            );
        }

        Ok(ReserveOutcome {
            reserved,
            unavailable,
            reserved_until,
        })
    }

    /// Releases the items `holder` currently holds among `ids`.
    ///
    /// Items held by someone else, already available, or sold are left alone.
    /// Returns the number of items released.
    #[tracing::instrument(skip(self, ids), fields(holder = %holder, item_count = ids.len()))]
    pub async fn release(&self, ids: &[ItemId], holder: &HolderId) -> Result<usize> {
        ensure_holder(holder)?;

        let mut released = 0;
        for id in distinct(ids) {
            if self.store.release_item(&id, holder).await? {
                released += 1;
            }
        }

        metrics::counter!("reservation_releases_total").increment(released as u64);
        tracing::debug!(released, "released holds");
        Ok(released)
    }

    /// Releases the holds of `holder` among `ids` whose deadline is no later
    /// than `until`.
    ///
    /// A checkout session remembers the deadline it was opened with. When the
    /// same holder opens another session over the same items the deadline
    /// moves forward, and those holds now belong to the newer session.
    #[tracing::instrument(skip(self, ids), fields(holder = %holder, item_count = ids.len()))]
    pub async fn release_unrenewed(
        &self,
        ids: &[ItemId],
        holder: &HolderId,
        until: DateTime<Utc>,
    ) -> Result<usize> {
        ensure_holder(holder)?;

        let mut released = 0;
        for id in distinct(ids) {
            if self.store.release_item_if_until(&id, holder, until).await? {
                released += 1;
            }
        }

        metrics::counter!("reservation_releases_total").increment(released as u64);
        tracing::debug!(released, "released unrenewed holds");
        Ok(released)
    }

    /// Sells the items `holder` still holds among `ids` to `buyer`.
    ///
    /// Items no longer held by `holder` (for example reclaimed after expiry)
    /// are skipped and reported, never errored.
    pub async fn commit(
        &self,
        ids: &[ItemId],
        holder: &HolderId,
        buyer: &str,
    ) -> Result<CommitOutcome> {
        self.commit_stamped(ids, holder, buyer, None).await
    }

    /// Like [`commit`](Self::commit), stamping each sold item with the
    /// checkout session that paid for it.
    pub async fn commit_for_session(
        &self,
        session_id: &CheckoutSessionId,
        ids: &[ItemId],
        holder: &HolderId,
        buyer: &str,
    ) -> Result<CommitOutcome> {
        self.commit_stamped(ids, holder, buyer, Some(session_id)).await
    }

    #[tracing::instrument(skip(self, ids), fields(holder = %holder, item_count = ids.len()))]
    async fn commit_stamped(
        &self,
        ids: &[ItemId],
        holder: &HolderId,
        buyer: &str,
        session_id: Option<&CheckoutSessionId>,
    ) -> Result<CommitOutcome> {
        ensure_holder(holder)?;

        let now = self.now();
        let mut outcome = CommitOutcome::default();
        for id in distinct(ids) {
            match self
                .store
                .commit_item(&id, holder, buyer, session_id, now)
                .await?
            {
                Some(item) => outcome.committed.push(item),
                None => outcome.skipped.push(id),
            }
        }

        metrics::counter!("reservation_commits_total").increment(outcome.committed.len() as u64);
        if outcome.is_partial() {
            tracing::warn!(
                committed = outcome.committed.len(),
                skipped = outcome.skipped.len(),
                "partial commit"
            );
        }
        Ok(outcome)
    }

    /// Ids among `ids` that `holder` could not reserve right now: sold, held
    /// by another holder with a live deadline, or unknown.
    #[tracing::instrument(skip(self, ids), fields(holder = %holder, item_count = ids.len()))]
    pub async fn unavailable_for(&self, ids: &[ItemId], holder: &HolderId) -> Result<Vec<ItemId>> {
        let now = self.now();
        let wanted = distinct(ids);
        let items = self.store.get_items(&wanted).await?;

        Ok(wanted
            .into_iter()
            .filter(|id| {
                items
                    .iter()
                    .find(|item| &item.id == id)
                    .is_none_or(|item| item.is_unavailable_to(holder, now))
            })
            .collect())
    }

    /// Live holds owned by `holder`. Lapsed holds not yet swept are omitted.
    pub async fn held_by(&self, holder: &HolderId) -> Result<Vec<ItemRecord>> {
        let now = self.now();
        let items = self.store.items_held_by(holder).await?;
        Ok(items
            .into_iter()
            .filter(|item| !item.hold_expired(now))
            .collect())
    }

    /// Items anyone could reserve right now.
    pub async fn list_free(&self, limit: Option<usize>, offset: Option<usize>) -> Result<Vec<ItemRecord>> {
        let mut query = ItemQuery::free_at(self.now());
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        if let Some(offset) = offset {
            query = query.offset(offset);
        }
        Ok(self.store.query_items(query).await?)
    }

    /// Looks up a single item.
    pub async fn get_item(&self, id: &ItemId) -> Result<Option<ItemRecord>> {
        Ok(self.store.get_item(id).await?)
    }

    /// Returns every lapsed hold to available in one set-based update.
    pub async fn release_expired(&self) -> Result<u64> {
        Ok(self.store.release_expired(self.now()).await?)
    }

    /// Best-effort release after a failed batch. Anything left behind lapses
    /// at its deadline.
    async fn undo_reserve(&self, ids: &[ItemId], holder: &HolderId) {
        let mut released = 0;
        for id in ids {
            match self.store.release_item(id, holder).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, item_id = %id, "undo release failed"),
            }
        }
        tracing::info!(released, "undid partial batch after store error");
    }
}

fn ensure_holder(holder: &HolderId) -> Result<()> {
    if holder.is_blank() {
        return Err(ReservationError::MissingHolder);
    }
    Ok(())
}

/// Drops repeated ids, keeping first-seen order.
fn distinct(ids: &[ItemId]) -> Vec<ItemId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(*id))
        .cloned()
        .collect()
}
