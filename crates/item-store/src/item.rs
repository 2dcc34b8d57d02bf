//! Item records and the disposition state machine.

use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId, Money};
use serde::{Deserialize, Serialize};

/// Where a unique item currently stands.
///
/// State transitions:
/// ```text
/// Available ──► Reserved ──► Sold
///     ▲             │
///     └─────────────┘  (release / expiry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Nobody holds the item; it can be reserved.
    #[default]
    Available,

    /// A holder has a time-bounded claim on the item.
    Reserved,

    /// The item has been paid for (terminal state).
    Sold,
}

impl Disposition {
    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Disposition::Sold)
    }

    /// Returns the stored label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Available => "available",
            Disposition::Reserved => "reserved",
            Disposition::Sold => "sold",
        }
    }

    /// Parses a stored label.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "available" => Some(Disposition::Available),
            "reserved" => Some(Disposition::Reserved),
            "sold" => Some(Disposition::Sold),
            _ => None,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Catalog fields for creating or refreshing an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub id: ItemId,
    pub title: String,
    pub price: Money,
}

impl NewItem {
    pub fn new(id: impl Into<ItemId>, title: impl Into<String>, price: Money) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            price,
        }
    }
}

/// One unique physical product and its current disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub title: String,
    pub price: Money,
    pub disposition: Disposition,
    /// Set only while `Reserved`.
    pub holder: Option<HolderId>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reserved_until: Option<DateTime<Utc>>,
    /// Set once on the transition into `Sold`, never changed afterwards.
    pub sold_at: Option<DateTime<Utc>>,
    pub sold_to: Option<String>,
    /// Checkout session whose payment sold the item, when one did.
    pub sold_session_id: Option<CheckoutSessionId>,
    pub created_at: DateTime<Utc>,
}

impl ItemRecord {
    /// Creates an available item from catalog fields.
    pub fn from_new(item: NewItem, now: DateTime<Utc>) -> Self {
        Self {
            id: item.id,
            title: item.title,
            price: item.price,
            disposition: Disposition::Available,
            holder: None,
            reserved_at: None,
            reserved_until: None,
            sold_at: None,
            sold_to: None,
            sold_session_id: None,
            created_at: now,
        }
    }

    /// True when the item reads `Reserved` but its deadline has passed.
    pub fn hold_expired(&self, now: DateTime<Utc>) -> bool {
        self.disposition == Disposition::Reserved
            && self.reserved_until.is_none_or(|until| until < now)
    }

    /// True when `holder` currently owns the reservation.
    pub fn is_held_by(&self, holder: &HolderId) -> bool {
        self.disposition == Disposition::Reserved && self.holder.as_ref() == Some(holder)
    }

    /// True when `holder` owns the reservation and its deadline is no later
    /// than `until`. A hold refreshed past `until` belongs to a newer checkout.
    pub fn is_held_by_until(&self, holder: &HolderId, until: DateTime<Utc>) -> bool {
        self.is_held_by(holder) && self.reserved_until.is_some_and(|deadline| deadline <= until)
    }

    /// True when the item was sold by the given checkout session.
    pub fn is_sold_by(&self, session_id: &CheckoutSessionId) -> bool {
        self.disposition == Disposition::Sold && self.sold_session_id.as_ref() == Some(session_id)
    }

    /// Guard of the reserve transition: available, already held by `holder`,
    /// or held by someone else whose hold has lapsed.
    pub fn is_reservable_by(&self, holder: &HolderId, now: DateTime<Utc>) -> bool {
        match self.disposition {
            Disposition::Available => true,
            Disposition::Reserved => self.is_held_by(holder) || self.hold_expired(now),
            Disposition::Sold => false,
        }
    }

    /// An item is unavailable to `holder` if it is sold, or reserved by a
    /// different holder with a deadline still in the future.
    pub fn is_unavailable_to(&self, holder: &HolderId, now: DateTime<Utc>) -> bool {
        !self.is_reservable_by(holder, now)
    }

    pub(crate) fn reserve(&mut self, holder: &HolderId, now: DateTime<Utc>, until: DateTime<Utc>) {
        self.disposition = Disposition::Reserved;
        self.holder = Some(holder.clone());
        self.reserved_at = Some(now);
        self.reserved_until = Some(until);
    }

    pub(crate) fn make_available(&mut self) {
        self.disposition = Disposition::Available;
        self.holder = None;
        self.reserved_at = None;
        self.reserved_until = None;
    }

    pub(crate) fn sell(
        &mut self,
        buyer: &str,
        session_id: Option<&CheckoutSessionId>,
        now: DateTime<Utc>,
    ) {
        self.disposition = Disposition::Sold;
        self.holder = None;
        self.reserved_at = None;
        self.reserved_until = None;
        self.sold_at = Some(now);
        self.sold_to = Some(buyer.to_string());
        self.sold_session_id = session_id.cloned();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn item() -> ItemRecord {
        ItemRecord::from_new(
            NewItem::new("I1", "Denim jacket", Money::from_cents(4500)),
            Utc::now(),
        )
    }

    #[test]
    fn test_default_disposition_is_available() {
        assert_eq!(Disposition::default(), Disposition::Available);
    }

    #[test]
    fn test_only_sold_is_terminal() {
        assert!(!Disposition::Available.is_terminal());
        assert!(!Disposition::Reserved.is_terminal());
        assert!(Disposition::Sold.is_terminal());
    }

    #[test]
    fn test_labels_round_trip() {
        for d in [Disposition::Available, Disposition::Reserved, Disposition::Sold] {
            assert_eq!(Disposition::parse(d.as_str()), Some(d));
        }
        assert_eq!(Disposition::parse("for-sale"), None);
    }

    #[test]
    fn test_serializes_lowercase() {
        let json = serde_json::to_string(&Disposition::Reserved).unwrap();
        assert_eq!(json, "\"reserved\"");
    }

    #[test]
    fn test_reservable_guard() {
        let now = Utc::now();
        let x = HolderId::new("x");
        let y = HolderId::new("y");
        let mut it = item();

        assert!(it.is_reservable_by(&x, now));

        it.reserve(&x, now, now + Duration::hours(1));
        assert!(it.is_reservable_by(&x, now));
        assert!(!it.is_reservable_by(&y, now + Duration::minutes(30)));
        assert!(it.is_reservable_by(&y, now + Duration::minutes(61)));

        it.sell("x", None, now);
        assert!(!it.is_reservable_by(&x, now));
        assert!(it.is_unavailable_to(&y, now));
    }

    #[test]
    fn test_sell_clears_hold_fields() {
        let now = Utc::now();
        let mut it = item();
        it.reserve(&HolderId::new("x"), now, now + Duration::hours(1));
        let session = CheckoutSessionId::new("cs_1");
        it.sell("buyer@example.com", Some(&session), now);

        assert_eq!(it.disposition, Disposition::Sold);
        assert!(it.holder.is_none());
        assert!(it.reserved_until.is_none());
        assert_eq!(it.sold_to.as_deref(), Some("buyer@example.com"));
        assert!(it.is_sold_by(&session));
        assert!(!it.is_sold_by(&CheckoutSessionId::new("cs_2")));
    }

    #[test]
    fn test_held_until_ignores_refreshed_holds() {
        let now = Utc::now();
        let x = HolderId::new("x");
        let mut it = item();
        let first_deadline = now + Duration::hours(1);
        it.reserve(&x, now, first_deadline);
        assert!(it.is_held_by_until(&x, first_deadline));

        it.reserve(&x, now + Duration::minutes(5), first_deadline + Duration::minutes(5));
        assert!(!it.is_held_by_until(&x, first_deadline));
        assert!(!it.is_held_by_until(&HolderId::new("y"), first_deadline + Duration::hours(1)));
    }
}
