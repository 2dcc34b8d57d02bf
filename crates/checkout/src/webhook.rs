//! Payment-completion webhook handling.
//!
//! The provider may deliver the same event more than once. Every path here is
//! safe to replay: commits are guarded by the holder and stamped with the
//! session, and orders are inserted only if none exists for the session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId, Money, OrderId};
use item_store::{
    CheckoutSessionStore, InsertOutcome, ItemRecord, ItemStore, ItemStoreExt, OrderLine,
    OrderRecord, OrderStore,
};
use reservation::ReservationEngine;
use serde::Deserialize;

use crate::error::Result;
use crate::provider::{PaymentStatus, SessionMetadata};
use crate::signature::SignatureVerifier;

/// Event types the handler acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentEventKind {
    SessionCompleted,
    AsyncPaymentSucceeded,
    AsyncPaymentFailed,
    SessionExpired,
    Unknown,
}

impl PaymentEventKind {
    pub fn parse(label: &str) -> Self {
        match label {
            "checkout.session.completed" => PaymentEventKind::SessionCompleted,
            "checkout.session.async_payment_succeeded" => PaymentEventKind::AsyncPaymentSucceeded,
            "checkout.session.async_payment_failed" => PaymentEventKind::AsyncPaymentFailed,
            "checkout.session.expired" => PaymentEventKind::SessionExpired,
            _ => PaymentEventKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventKind::SessionCompleted => "checkout.session.completed",
            PaymentEventKind::AsyncPaymentSucceeded => "checkout.session.async_payment_succeeded",
            PaymentEventKind::AsyncPaymentFailed => "checkout.session.async_payment_failed",
            PaymentEventKind::SessionExpired => "checkout.session.expired",
            PaymentEventKind::Unknown => "unknown",
        }
    }
}

/// A provider event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: SessionObject,
}

/// The checkout session carried by an event.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionObject {
    pub id: CheckoutSessionId,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

impl PaymentEvent {
    pub fn kind(&self) -> PaymentEventKind {
        PaymentEventKind::parse(&self.event_type)
    }

    pub fn session(&self) -> &SessionObject {
        &self.data.object
    }
}

impl SessionObject {
    /// The email the shopper paid with, if the provider reported one.
    pub fn email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|details| details.email.as_deref())
            .or(self.customer_email.as_deref())
            .filter(|email| !email.is_empty())
    }
}

/// What a delivered event amounted to. Every variant is acknowledged to the
/// provider with a 2xx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Items were committed and the order recorded.
    OrderCreated { order: OrderRecord },
    /// An order for this session already exists; nothing changed.
    AlreadyProcessed { order_id: OrderId },
    /// The session ended without payment and its holds were given back.
    Released {
        session_id: CheckoutSessionId,
        released: usize,
    },
    /// The session completed but funds have not settled yet.
    AwaitingPayment { session_id: CheckoutSessionId },
    /// Neither a local mapping nor provider metadata identifies the items.
    UnknownSession { session_id: CheckoutSessionId },
    /// The event type is not handled or the body could not be read.
    Ignored,
}

impl CompletionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionOutcome::OrderCreated { .. } => "order_created",
            CompletionOutcome::AlreadyProcessed { .. } => "already_processed",
            CompletionOutcome::Released { .. } => "released",
            CompletionOutcome::AwaitingPayment { .. } => "awaiting_payment",
            CompletionOutcome::UnknownSession { .. } => "unknown_session",
            CompletionOutcome::Ignored => "ignored",
        }
    }
}

/// The reservation a checkout session was opened over.
#[derive(Debug, Clone)]
struct SessionMapping {
    holder: HolderId,
    item_ids: Vec<ItemId>,
    reserved_until: Option<DateTime<Utc>>,
}

/// Turns provider callbacks into sold items and exactly one order per session.
pub struct PaymentCompletionHandler<S>
where
    S: ItemStore + CheckoutSessionStore + OrderStore,
{
    engine: Arc<ReservationEngine<S>>,
    verifier: SignatureVerifier,
}

impl<S> PaymentCompletionHandler<S>
where
    S: ItemStore + CheckoutSessionStore + OrderStore,
{
    pub fn new(engine: Arc<ReservationEngine<S>>, verifier: SignatureVerifier) -> Self {
        Self { engine, verifier }
    }

    /// Authenticates and processes a raw delivery.
    ///
    /// A failed signature check is the only error that is not a store
    /// failure; everything else is reported as an outcome.
    #[tracing::instrument(skip_all, fields(payload_len = payload.len()))]
    pub async fn handle(&self, payload: &[u8], signature: Option<&str>) -> Result<CompletionOutcome> {
        if let Err(e) = self.verifier.verify(payload, signature, self.engine.now()) {
            metrics::counter!("payment_webhook_rejections_total").increment(1);
            tracing::warn!(error = %e, "webhook rejected");
            return Err(e.into());
        }

        let event: PaymentEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable webhook body acknowledged");
                return Ok(CompletionOutcome::Ignored);
            }
        };

        self.process_event(event).await
    }

    /// Processes an already authenticated event.
    #[tracing::instrument(
        skip(self, event),
        fields(event_id = %event.id, event_type = %event.event_type, session_id = %event.session().id)
    )]
    pub async fn process_event(&self, event: PaymentEvent) -> Result<CompletionOutcome> {
        let kind = event.kind();
        metrics::counter!("payment_webhooks_total", "type" => kind.as_str()).increment(1);

        let session = event.data.object;
        let outcome = match kind {
            PaymentEventKind::SessionCompleted => {
                // Delayed payment methods complete unpaid and settle later.
                let status = session.payment_status.unwrap_or(PaymentStatus::Paid);
                if status.is_settled() {
                    self.complete(&session).await?
                } else {
                    tracing::info!(status = ?status, "session completed without settled payment");
                    CompletionOutcome::AwaitingPayment {
                        session_id: session.id.clone(),
                    }
                }
            }
            PaymentEventKind::AsyncPaymentSucceeded => self.complete(&session).await?,
            PaymentEventKind::AsyncPaymentFailed | PaymentEventKind::SessionExpired => {
                self.release(&session).await?
            }
            PaymentEventKind::Unknown => {
                tracing::debug!("event type not handled");
                CompletionOutcome::Ignored
            }
        };

        tracing::info!(outcome = outcome.as_str(), "webhook processed");
        Ok(outcome)
    }

    async fn complete(&self, session: &SessionObject) -> Result<CompletionOutcome> {
        let store = self.engine.store();

        if let Some(existing) = store.get_order_by_session(&session.id).await? {
            tracing::info!(order_id = %existing.order_id, "order already recorded");
            return Ok(CompletionOutcome::AlreadyProcessed {
                order_id: existing.order_id,
            });
        }

        let Some(SessionMapping {
            holder, item_ids, ..
        }) = self.mapping_for(session).await?
        else {
            return Ok(self.unknown(session));
        };

        let buyer = session
            .email()
            .map(str::to_string)
            .unwrap_or_else(|| holder.to_string());
        let commit = self
            .engine
            .commit_for_session(&session.id, &item_ids, &holder, &buyer)
            .await?;

        // A skipped item still counts when this session already sold it, as
        // on a redelivery after a crash between commit and insert. Sold by
        // any other session means it was paid for twice.
        let mut sold: Vec<ItemRecord> = commit.committed;
        if !commit.skipped.is_empty() {
            let rechecked = store.get_items(&commit.skipped).await?;
            sold.extend(rechecked.into_iter().filter(|item| item.is_sold_by(&session.id)));
        }

        let mut lines = Vec::new();
        let mut fulfilled = Vec::new();
        let mut unfulfilled = Vec::new();
        for id in &item_ids {
            match sold.iter().find(|item| &item.id == id) {
                Some(item) => {
                    lines.push(OrderLine {
                        item_id: item.id.clone(),
                        title: item.title.clone(),
                        price: item.price,
                    });
                    fulfilled.push(id.clone());
                }
                None => unfulfilled.push(id.clone()),
            }
        }

        let needs_reconciliation = !unfulfilled.is_empty();
        let order = OrderRecord {
            order_id: OrderId::new(),
            checkout_session_id: session.id.clone(),
            user_id: holder,
            buyer,
            customer_email: session.email().map(str::to_string),
            subtotal: lines.iter().map(|line| line.price).sum(),
            lines,
            amount_paid: session.amount_total.map(Money::from_cents),
            payment_reference: session.payment_intent.clone(),
            fulfilled_item_ids: fulfilled,
            unfulfilled_item_ids: unfulfilled,
            needs_reconciliation,
            created_at: self.engine.now(),
        };

        match store.insert_order_if_absent(order).await? {
            InsertOutcome::Inserted(order) => {
                if order.needs_reconciliation {
                    metrics::counter!("orders_reconciliation_total").increment(1);
                    tracing::warn!(
                        order_id = %order.order_id,
                        unfulfilled = ?order.unfulfilled_item_ids,
                        "paid items could not be committed; order flagged for reconciliation"
                    );
                } else {
                    tracing::info!(order_id = %order.order_id, "order created");
                }
                Ok(CompletionOutcome::OrderCreated { order })
            }
            InsertOutcome::AlreadyExists(existing) => Ok(CompletionOutcome::AlreadyProcessed {
                order_id: existing.order_id,
            }),
        }
    }

    /// Gives back the holds this session still owns. A hold the holder
    /// renewed through a later session carries a later deadline and stays.
    async fn release(&self, session: &SessionObject) -> Result<CompletionOutcome> {
        let Some(mapping) = self.mapping_for(session).await? else {
            return Ok(self.unknown(session));
        };

        let released = match mapping.reserved_until {
            Some(until) => {
                self.engine
                    .release_unrenewed(&mapping.item_ids, &mapping.holder, until)
                    .await?
            }
            None => {
                tracing::warn!("session deadline unknown; releasing every hold of the holder");
                self.engine.release(&mapping.item_ids, &mapping.holder).await?
            }
        };
        Ok(CompletionOutcome::Released {
            session_id: session.id.clone(),
            released,
        })
    }

    /// Local mapping first, then the metadata attached at session creation.
    async fn mapping_for(&self, session: &SessionObject) -> Result<Option<SessionMapping>> {
        if let Some(record) = self.engine.store().get_session(&session.id).await? {
            return Ok(Some(SessionMapping {
                holder: record.holder,
                item_ids: record.item_ids,
                reserved_until: Some(record.reserved_until),
            }));
        }

        Ok(SessionMetadata::from_map(&session.metadata).map(|metadata| {
            tracing::info!("session mapping recovered from provider metadata");
            SessionMapping {
                holder: metadata.holder_id,
                item_ids: metadata.item_ids,
                reserved_until: metadata.reserved_until,
            }
        }))
    }

    fn unknown(&self, session: &SessionObject) -> CompletionOutcome {
        metrics::counter!("orders_reconciliation_total").increment(1);
        tracing::warn!(session_id = %session.id, "webhook for unknown checkout session");
        CompletionOutcome::UnknownSession {
            session_id: session.id.clone(),
        }
    }
}
