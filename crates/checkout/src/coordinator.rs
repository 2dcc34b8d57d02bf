//! Checkout session coordinator.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{CheckoutSessionId, HolderId, ItemId, Money, OrderId};
use item_store::{CheckoutSessionRecord, CheckoutSessionStore, ItemRecord, ItemStore, OrderStore};
use reservation::ReservationEngine;
use serde::{Deserialize, Serialize};

use crate::error::{CheckoutError, Result};
use crate::pricing::{PricingPolicy, Quote};
use crate::provider::{
    PaymentProvider, PaymentStatus, SessionLineItem, SessionMetadata, SessionRequest,
};

/// Settings for opening checkout sessions.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// How long each reserved item is held.
    pub hold_ttl: Duration,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub pricing: PricingPolicy,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::hours(1),
            currency: "usd".to_string(),
            success_url: "http://localhost:5173/order-confirmation?session_id={CHECKOUT_SESSION_ID}"
                .to_string(),
            cancel_url: "http://localhost:5173/cart".to_string(),
            pricing: PricingPolicy::default(),
        }
    }
}

/// One cart line as submitted by the client.
///
/// Title and price are informational: the stored item is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub id: ItemId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<Money>,
    #[serde(default = "one")]
    pub quantity: u32,
}

fn one() -> u32 {
    1
}

impl CartLine {
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            title: None,
            price: None,
            quantity: 1,
        }
    }
}

/// A request to check out a cart.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub holder: HolderId,
    pub lines: Vec<CartLine>,
    pub customer_email: Option<String>,
}

/// Result of reserving a whole batch.
#[derive(Debug, Clone)]
pub enum BatchReservation {
    /// Every item is held by the caller.
    Held {
        items: Vec<ItemRecord>,
        reserved_until: DateTime<Utc>,
    },
    /// At least one item was unavailable; nothing is held.
    Unavailable { unavailable_ids: Vec<ItemId> },
}

/// Result of starting a checkout.
#[derive(Debug, Clone)]
pub enum CheckoutOutcome {
    /// The provider session is open and the cart is held.
    Created {
        session_id: CheckoutSessionId,
        redirect_url: String,
        reserved_until: DateTime<Utc>,
        quote: Quote,
    },
    /// Some items could not be reserved; nothing is held.
    Unavailable { unavailable_ids: Vec<ItemId> },
}

/// What the order-confirmation page needs to know about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVerification {
    pub session_id: CheckoutSessionId,
    pub payment_status: PaymentStatus,
    pub customer_email: Option<String>,
    pub amount_total: Option<Money>,
    /// Set once the completion webhook has produced the order.
    pub order_id: Option<OrderId>,
}

/// Orchestrates "reserve N items → open a payment session" as one operation.
///
/// The reservation engine never rolls back on its own, so the coordinator
/// owns both compensating actions: releasing the reserved subset when any
/// item is unavailable, and releasing the whole batch when the provider
/// session cannot be opened or recorded.
pub struct CheckoutCoordinator<S, P>
where
    S: ItemStore + CheckoutSessionStore + OrderStore,
    P: PaymentProvider,
{
    engine: Arc<ReservationEngine<S>>,
    provider: P,
    config: CheckoutConfig,
}

impl<S, P> CheckoutCoordinator<S, P>
where
    S: ItemStore + CheckoutSessionStore + OrderStore,
    P: PaymentProvider,
{
    /// Creates a new checkout coordinator.
    pub fn new(engine: Arc<ReservationEngine<S>>, provider: P, config: CheckoutConfig) -> Self {
        Self {
            engine,
            provider,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<ReservationEngine<S>> {
        &self.engine
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Reserves every id for `holder`, or none of them.
    ///
    /// On a partial result the reserved subset is released before returning
    /// [`BatchReservation::Unavailable`]. Reserving a set the holder already
    /// holds refreshes the deadline.
    #[tracing::instrument(skip(self, ids), fields(holder = %holder, item_count = ids.len()))]
    pub async fn reserve_batch(&self, ids: &[ItemId], holder: &HolderId) -> Result<BatchReservation> {
        if ids.is_empty() {
            return Err(CheckoutError::InvalidCart("no items requested".to_string()));
        }

        let outcome = self
            .engine
            .try_reserve(ids, holder, self.config.hold_ttl)
            .await?;

        if outcome.is_complete() {
            return Ok(BatchReservation::Held {
                items: outcome.reserved,
                reserved_until: outcome.reserved_until,
            });
        }

        if !outcome.reserved.is_empty() {
            self.compensate(&outcome.reserved_ids(), holder, "partial reservation")
                .await;
        }

        Ok(BatchReservation::Unavailable {
            unavailable_ids: outcome.unavailable,
        })
    }

    /// Releases the holder's items among `ids`.
    pub async fn release(&self, ids: &[ItemId], holder: &HolderId) -> Result<usize> {
        Ok(self.engine.release(ids, holder).await?)
    }

    /// Reserves the cart and opens a payment session for it.
    ///
    /// A reservation never outlives a failed session creation: any error after
    /// the reserve step releases the batch before it is returned.
    #[tracing::instrument(
        skip(self, request),
        fields(holder = %request.holder, item_count = request.lines.len())
    )]
    pub async fn begin_checkout(&self, request: CheckoutRequest) -> Result<CheckoutOutcome> {
        let started = std::time::Instant::now();
        let ids = validate_cart(&request)?;

        // 1. Reserve every item, or none
        let (items, reserved_until) = match self.reserve_batch(&ids, &request.holder).await? {
            BatchReservation::Held {
                items,
                reserved_until,
            } => (items, reserved_until),
            BatchReservation::Unavailable { unavailable_ids } => {
                metrics::histogram!("checkout_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                return Ok(CheckoutOutcome::Unavailable { unavailable_ids });
            }
        };

        // 2. Price from the store and open the provider session
        warn_on_price_mismatch(&request.lines, &items);
        let quote = self.config.pricing.quote(&items);
        let session_request = self.session_request(&request, &items, &quote, reserved_until);

        let session = match self.provider.create_session(session_request).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "payment session creation failed");
                self.compensate(&ids, &request.holder, "session creation failed")
                    .await;
                metrics::histogram!("checkout_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                return Err(e);
            }
        };

        // 3. Record the session → reservation mapping for the webhook
        let record = CheckoutSessionRecord {
            session_id: session.id.clone(),
            holder: request.holder.clone(),
            item_ids: ids.clone(),
            amount: quote.total,
            reserved_until,
            created_at: self.engine.now(),
        };
        if let Err(e) = self.engine.store().save_session(record).await {
            tracing::error!(error = %e, session_id = %session.id, "failed to record checkout session");
            self.compensate(&ids, &request.holder, "session mapping not saved")
                .await;
            return Err(e.into());
        }

        let duration = started.elapsed().as_secs_f64();
        metrics::histogram!("checkout_duration_seconds").record(duration);
        metrics::counter!("checkout_sessions_created_total").increment(1);
        tracing::info!(session_id = %session.id, total = %quote.total, "checkout session created");

        Ok(CheckoutOutcome::Created {
            session_id: session.id,
            redirect_url: session.redirect_url,
            reserved_until,
            quote,
        })
    }

    /// Reports the provider's view of a session and whether its order exists.
    #[tracing::instrument(skip(self))]
    pub async fn verify_session(&self, session_id: &CheckoutSessionId) -> Result<SessionVerification> {
        let details = self
            .provider
            .retrieve_session(session_id)
            .await?
            .ok_or_else(|| CheckoutError::SessionNotFound(session_id.clone()))?;

        let order_id = self
            .engine
            .store()
            .get_order_by_session(session_id)
            .await?
            .map(|order| order.order_id);

        Ok(SessionVerification {
            session_id: details.id,
            payment_status: details.payment_status,
            customer_email: details.customer_email,
            amount_total: details.amount_total,
            order_id,
        })
    }

    fn session_request(
        &self,
        request: &CheckoutRequest,
        items: &[ItemRecord],
        quote: &Quote,
        reserved_until: DateTime<Utc>,
    ) -> SessionRequest {
        let mut line_items: Vec<SessionLineItem> = items
            .iter()
            .map(|item| SessionLineItem {
                name: item.title.clone(),
                unit_amount: item.price,
                quantity: 1,
            })
            .collect();
        if quote.shipping.is_positive() {
            line_items.push(SessionLineItem {
                name: "Shipping".to_string(),
                unit_amount: quote.shipping,
                quantity: 1,
            });
        }
        if quote.tax.is_positive() {
            line_items.push(SessionLineItem {
                name: "Tax".to_string(),
                unit_amount: quote.tax,
                quantity: 1,
            });
        }

        SessionRequest {
            metadata: SessionMetadata {
                holder_id: request.holder.clone(),
                item_ids: items.iter().map(|item| item.id.clone()).collect(),
                reserved_until: Some(reserved_until),
            },
            line_items,
            currency: self.config.currency.clone(),
            success_url: self.config.success_url.clone(),
            cancel_url: self.config.cancel_url.clone(),
            customer_email: request.customer_email.clone(),
            expires_at: reserved_until,
        }
    }

    /// Releases `ids` for `holder`. Failures are logged; the holds will lapse.
    async fn compensate(&self, ids: &[ItemId], holder: &HolderId, reason: &str) {
        metrics::counter!("checkout_compensations_total").increment(1);
        match self.engine.release(ids, holder).await {
            Ok(released) => {
                tracing::info!(released, reason, "released reservation");
            }
            Err(e) => {
                tracing::error!(error = %e, reason, "compensating release failed");
            }
        }
    }
}

/// Checks the cart shape and returns its distinct ids in order.
fn validate_cart(request: &CheckoutRequest) -> Result<Vec<ItemId>> {
    if request.holder.is_blank() {
        return Err(CheckoutError::InvalidCart("holder id is required".to_string()));
    }
    if request.lines.is_empty() {
        return Err(CheckoutError::InvalidCart("cart is empty".to_string()));
    }
    if let Some(line) = request.lines.iter().find(|line| line.quantity != 1) {
        return Err(CheckoutError::InvalidCart(format!(
            "item {} has quantity {}; every item is unique",
            line.id, line.quantity
        )));
    }

    let mut seen = HashSet::new();
    Ok(request
        .lines
        .iter()
        .filter(|line| seen.insert(&line.id))
        .map(|line| line.id.clone())
        .collect())
}

fn warn_on_price_mismatch(lines: &[CartLine], items: &[ItemRecord]) {
    for line in lines {
        let Some(claimed) = line.price else { continue };
        if let Some(item) = items.iter().find(|item| item.id == line.id)
            && item.price != claimed
        {
            tracing::warn!(
                item_id = %line.id,
                claimed = %claimed,
                stored = %item.price,
                "cart price differs from stored price"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use item_store::{Disposition, InMemoryStore, NewItem};

    use super::*;
    use crate::provider::InMemoryPaymentProvider;

    async fn setup() -> CheckoutCoordinator<InMemoryStore, InMemoryPaymentProvider> {
        let store = InMemoryStore::new();
        for (id, cents) in [("A", 2500), ("B", 1500)] {
            store
                .upsert_item(NewItem::new(id, format!("Item {id}"), Money::from_cents(cents)), Utc::now())
                .await
                .unwrap();
        }
        CheckoutCoordinator::new(
            Arc::new(ReservationEngine::new(store)),
            InMemoryPaymentProvider::new(),
            CheckoutConfig::default(),
        )
    }

    fn cart(holder: &str, ids: &[&str]) -> CheckoutRequest {
        CheckoutRequest {
            holder: HolderId::new(holder),
            lines: ids.iter().map(|id| CartLine::new(*id)).collect(),
            customer_email: None,
        }
    }

    async fn disposition(
        coordinator: &CheckoutCoordinator<InMemoryStore, InMemoryPaymentProvider>,
        id: &str,
    ) -> Disposition {
        coordinator
            .engine()
            .get_item(&ItemId::new(id))
            .await
            .unwrap()
            .unwrap()
            .disposition
    }

    #[tokio::test]
    async fn test_begin_checkout_creates_session() {
        let coordinator = setup().await;

        let outcome = coordinator.begin_checkout(cart("x", &["A", "B"])).await.unwrap();

        let CheckoutOutcome::Created { session_id, quote, .. } = outcome else {
            panic!("expected a session");
        };
        assert_eq!(quote.total, Money::from_cents(4000 + 500 + 800));

        let request = coordinator.provider().request_for(&session_id).unwrap();
        assert_eq!(request.line_items.len(), 4);
        assert_eq!(request.amount(), quote.total);

        let saved = coordinator
            .engine()
            .store()
            .get_session(&session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.item_ids, vec![ItemId::new("A"), ItemId::new("B")]);
        assert_eq!(disposition(&coordinator, "A").await, Disposition::Reserved);
    }

    #[tokio::test]
    async fn test_partial_reservation_rolls_back() {
        let coordinator = setup().await;
        coordinator
            .reserve_batch(&[ItemId::new("B")], &HolderId::new("y"))
            .await
            .unwrap();

        let outcome = coordinator.begin_checkout(cart("z", &["A", "B"])).await.unwrap();

        let CheckoutOutcome::Unavailable { unavailable_ids } = outcome else {
            panic!("expected a conflict");
        };
        assert_eq!(unavailable_ids, vec![ItemId::new("B")]);
        assert_eq!(disposition(&coordinator, "A").await, Disposition::Available);
        let b = coordinator.engine().get_item(&ItemId::new("B")).await.unwrap().unwrap();
        assert!(b.is_held_by(&HolderId::new("y")));
        assert_eq!(coordinator.provider().session_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_releases_reservation() {
        let coordinator = setup().await;
        coordinator.provider().set_fail_on_create(true);

        let result = coordinator.begin_checkout(cart("x", &["A", "B"])).await;

        assert!(matches!(result, Err(CheckoutError::Provider(_))));
        assert_eq!(disposition(&coordinator, "A").await, Disposition::Available);
        assert_eq!(disposition(&coordinator, "B").await, Disposition::Available);
    }

    #[tokio::test]
    async fn test_same_holder_may_check_out_again() {
        let coordinator = setup().await;
        coordinator.begin_checkout(cart("x", &["A"])).await.unwrap();

        let again = coordinator.begin_checkout(cart("x", &["A"])).await.unwrap();

        assert!(matches!(again, CheckoutOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn test_invalid_carts_rejected() {
        let coordinator = setup().await;

        let empty = coordinator.begin_checkout(cart("x", &[])).await;
        assert!(matches!(empty, Err(CheckoutError::InvalidCart(_))));

        let no_holder = coordinator.begin_checkout(cart("", &["A"])).await;
        assert!(matches!(no_holder, Err(CheckoutError::InvalidCart(_))));

        let mut doubled = cart("x", &["A"]);
        doubled.lines[0].quantity = 2;
        let doubled = coordinator.begin_checkout(doubled).await;
        assert!(matches!(doubled, Err(CheckoutError::InvalidCart(_))));

        assert_eq!(disposition(&coordinator, "A").await, Disposition::Available);
    }

    #[tokio::test]
    async fn test_duplicate_lines_collapse() {
        let coordinator = setup().await;

        let outcome = coordinator.begin_checkout(cart("x", &["A", "A"])).await.unwrap();

        let CheckoutOutcome::Created { quote, .. } = outcome else {
            panic!("expected a session");
        };
        assert_eq!(quote.subtotal, Money::from_cents(2500));
    }

    #[tokio::test]
    async fn test_verify_session() {
        let coordinator = setup().await;
        let CheckoutOutcome::Created { session_id, .. } =
            coordinator.begin_checkout(cart("x", &["A"])).await.unwrap()
        else {
            panic!("expected a session");
        };

        let before = coordinator.verify_session(&session_id).await.unwrap();
        assert_eq!(before.payment_status, PaymentStatus::Unpaid);
        assert!(before.order_id.is_none());

        coordinator.provider().mark_paid(&session_id);
        let after = coordinator.verify_session(&session_id).await.unwrap();
        assert_eq!(after.payment_status, PaymentStatus::Paid);

        let missing = coordinator
            .verify_session(&CheckoutSessionId::new("cs_nope"))
            .await;
        assert!(matches!(missing, Err(CheckoutError::SessionNotFound(_))));
    }
}
