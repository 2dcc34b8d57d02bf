use chrono::{DateTime, Utc};
use common::{HolderId, ItemId};

use crate::{Disposition, ItemRecord};

/// Builder for constructing item queries.
///
/// All set filters must match. Results are ordered by creation time, then id.
#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    /// Restrict to these item ids.
    pub ids: Option<Vec<ItemId>>,

    /// Filter by disposition (any of these).
    pub dispositions: Option<Vec<Disposition>>,

    /// Filter by current holder.
    pub holder: Option<HolderId>,

    /// Only items anyone could reserve at this instant: available, or reserved
    /// with a lapsed deadline.
    pub free_at: Option<DateTime<Utc>>,

    /// Maximum number of items to return.
    pub limit: Option<usize>,

    /// Number of items to skip.
    pub offset: Option<usize>,
}

impl ItemQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Items currently held by `holder`.
    pub fn held_by(holder: HolderId) -> Self {
        Self {
            dispositions: Some(vec![Disposition::Reserved]),
            holder: Some(holder),
            ..Default::default()
        }
    }

    /// Items that can be reserved at `now`.
    pub fn free_at(now: DateTime<Utc>) -> Self {
        Self {
            free_at: Some(now),
            ..Default::default()
        }
    }

    pub fn ids(mut self, ids: Vec<ItemId>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filters by disposition.
    pub fn disposition(mut self, disposition: Disposition) -> Self {
        self.dispositions = Some(vec![disposition]);
        self
    }

    /// Sets the maximum number of items to return.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the number of items to skip.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Evaluates the filters against a record.
    pub fn matches(&self, item: &ItemRecord) -> bool {
        if let Some(ref ids) = self.ids
            && !ids.contains(&item.id)
        {
            return false;
        }
        if let Some(ref dispositions) = self.dispositions
            && !dispositions.contains(&item.disposition)
        {
            return false;
        }
        if let Some(ref holder) = self.holder
            && item.holder.as_ref() != Some(holder)
        {
            return false;
        }
        if let Some(now) = self.free_at
            && !(item.disposition == Disposition::Available || item.hold_expired(now))
        {
            return false;
        }
        true
    }
}
