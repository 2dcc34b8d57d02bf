//! Payment provider trait and implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId, Money};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{CheckoutError, Result};

/// One priced line on the provider's checkout page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLineItem {
    pub name: String,
    pub unit_amount: Money,
    pub quantity: u32,
}

/// Opaque data attached to a provider session so the webhook can recover the
/// reservation even without the local mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub holder_id: HolderId,
    pub item_ids: Vec<ItemId>,
    /// Deadline the session's holds were stamped with.
    pub reserved_until: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    const HOLDER_KEY: &'static str = "holderId";
    const ITEMS_KEY: &'static str = "itemIds";
    const UNTIL_KEY: &'static str = "reservedUntil";

    /// Flattens into the provider's string key/value metadata.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let ids: Vec<&str> = self.item_ids.iter().map(ItemId::as_str).collect();
        let mut pairs = vec![
            (Self::HOLDER_KEY.to_string(), self.holder_id.to_string()),
            (Self::ITEMS_KEY.to_string(), ids.join(",")),
        ];
        if let Some(until) = self.reserved_until {
            pairs.push((Self::UNTIL_KEY.to_string(), until.to_rfc3339()));
        }
        pairs
    }

    /// Reads metadata written by [`to_pairs`](Self::to_pairs).
    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        let holder_id = HolderId::new(map.get(Self::HOLDER_KEY)?.as_str());
        if holder_id.is_blank() {
            return None;
        }
        let item_ids: Vec<ItemId> = map
            .get(Self::ITEMS_KEY)?
            .split(',')
            .filter(|id| !id.is_empty())
            .map(ItemId::new)
            .collect();
        if item_ids.is_empty() {
            return None;
        }
        let reserved_until = map
            .get(Self::UNTIL_KEY)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|until| until.with_timezone(&Utc));
        Some(Self {
            holder_id,
            item_ids,
            reserved_until,
        })
    }
}

/// Everything the provider needs to open a checkout page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub metadata: SessionMetadata,
    pub line_items: Vec<SessionLineItem>,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    /// The provider closes the session at this time.
    pub expires_at: DateTime<Utc>,
}

impl SessionRequest {
    /// Sum of all line items.
    pub fn amount(&self) -> Money {
        self.line_items
            .iter()
            .map(|line| Money::from_cents(line.unit_amount.cents() * i64::from(line.quantity)))
            .sum()
    }
}

/// A session the provider has opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSession {
    pub id: CheckoutSessionId,
    pub redirect_url: String,
}

/// Payment status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

impl PaymentStatus {
    /// True when funds are secured and the items may be sold.
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::NoPaymentRequired)
    }
}

/// A provider session as read back from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDetails {
    pub id: CheckoutSessionId,
    pub payment_status: PaymentStatus,
    pub customer_email: Option<String>,
    pub amount_total: Option<Money>,
    pub payment_reference: Option<String>,
    pub metadata: Option<SessionMetadata>,
}

/// Trait for the external payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Opens a checkout session and returns where to send the shopper.
    async fn create_session(&self, request: SessionRequest) -> Result<ProviderSession>;

    /// Reads a session back. Returns None if the provider does not know it.
    async fn retrieve_session(&self, id: &CheckoutSessionId) -> Result<Option<SessionDetails>>;
}

#[async_trait]
impl<P: PaymentProvider + ?Sized> PaymentProvider for Arc<P> {
    async fn create_session(&self, request: SessionRequest) -> Result<ProviderSession> {
        (**self).create_session(request).await
    }

    async fn retrieve_session(&self, id: &CheckoutSessionId) -> Result<Option<SessionDetails>> {
        (**self).retrieve_session(id).await
    }
}

#[derive(Debug, Default)]
struct InMemoryProviderState {
    sessions: HashMap<String, (SessionRequest, PaymentStatus)>,
    next_id: u32,
    fail_on_create: bool,
}

/// In-memory payment provider for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentProvider {
    state: Arc<RwLock<InMemoryProviderState>>,
}

impl InMemoryPaymentProvider {
    /// Creates a new in-memory provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryProviderState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryProviderState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Configures the provider to fail session creation.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.write().fail_on_create = fail;
    }

    /// Returns the number of sessions opened.
    pub fn session_count(&self) -> usize {
        self.read().sessions.len()
    }

    /// Returns the request a session was opened with.
    pub fn request_for(&self, id: &CheckoutSessionId) -> Option<SessionRequest> {
        self.read()
            .sessions
            .get(id.as_str())
            .map(|(request, _)| request.clone())
    }

    /// Simulates the shopper paying on the provider's page.
    pub fn mark_paid(&self, id: &CheckoutSessionId) -> bool {
        match self.write().sessions.get_mut(id.as_str()) {
            Some((_, status)) => {
                *status = PaymentStatus::Paid;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    async fn create_session(&self, request: SessionRequest) -> Result<ProviderSession> {
        let mut state = self.write();

        if state.fail_on_create {
            return Err(CheckoutError::Provider("session creation declined".to_string()));
        }

        state.next_id += 1;
        let id = format!("cs_test_{:04}", state.next_id);
        let redirect_url = format!("https://pay.example.test/c/{id}");
        state
            .sessions
            .insert(id.clone(), (request, PaymentStatus::Unpaid));

        Ok(ProviderSession {
            id: CheckoutSessionId::new(id),
            redirect_url,
        })
    }

    async fn retrieve_session(&self, id: &CheckoutSessionId) -> Result<Option<SessionDetails>> {
        let state = self.read();
        Ok(state
            .sessions
            .get(id.as_str())
            .map(|(request, status)| SessionDetails {
                id: id.clone(),
                payment_status: *status,
                customer_email: request.customer_email.clone(),
                amount_total: Some(request.amount()),
                payment_reference: status
                    .is_settled()
                    .then(|| format!("pi_{}", id.as_str())),
                metadata: Some(request.metadata.clone()),
            }))
    }
}

/// Stripe-compatible HTTP provider client.
///
/// Sessions are created with a form-encoded `POST {base}/v1/checkout/sessions`
/// and read with `GET {base}/v1/checkout/sessions/{id}`, authenticated with
/// the secret key as a bearer token.
#[derive(Clone, Debug)]
pub struct HttpPaymentProvider {
    base_url: String,
    api_key: String,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetrievedSession {
    id: String,
    payment_status: PaymentStatus,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CustomerDetails {
    #[serde(default)]
    email: Option<String>,
}

impl HttpPaymentProvider {
    /// Creates a client for the provider at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CheckoutError::Provider(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http_client,
        })
    }

    fn form_for(request: &SessionRequest) -> Vec<(String, String)> {
        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            (
                "client_reference_id".to_string(),
                request.metadata.holder_id.to_string(),
            ),
            (
                "expires_at".to_string(),
                request.expires_at.timestamp().to_string(),
            ),
        ];
        if let Some(email) = &request.customer_email {
            form.push(("customer_email".to_string(), email.clone()));
        }
        for (i, line) in request.line_items.iter().enumerate() {
            let prefix = format!("line_items[{i}]");
            form.push((
                format!("{prefix}[price_data][currency]"),
                request.currency.clone(),
            ));
            form.push((
                format!("{prefix}[price_data][product_data][name]"),
                line.name.clone(),
            ));
            form.push((
                format!("{prefix}[price_data][unit_amount]"),
                line.unit_amount.cents().to_string(),
            ));
            form.push((format!("{prefix}[quantity]"), line.quantity.to_string()));
        }
        for (key, value) in request.metadata.to_pairs() {
            form.push((format!("metadata[{key}]"), value));
        }
        form
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_session(&self, request: SessionRequest) -> Result<ProviderSession> {
        let response = self
            .http_client
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .form(&Self::form_for(&request))
            .send()
            .await
            .map_err(|e| CheckoutError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %error_body, "checkout session creation failed");
            return Err(CheckoutError::Provider(format!(
                "session creation returned {status}"
            )));
        }

        let created: CreatedSession = response
            .json()
            .await
            .map_err(|e| CheckoutError::Provider(e.to_string()))?;
        let redirect_url = created.url.ok_or_else(|| {
            CheckoutError::Provider(format!("session {} has no redirect url", created.id))
        })?;

        Ok(ProviderSession {
            id: CheckoutSessionId::new(created.id),
            redirect_url,
        })
    }

    async fn retrieve_session(&self, id: &CheckoutSessionId) -> Result<Option<SessionDetails>> {
        let response = self
            .http_client
            .get(format!("{}/v1/checkout/sessions/{}", self.base_url, id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| CheckoutError::Provider(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(CheckoutError::Provider(format!(
                "session lookup returned {status}"
            )));
        }

        let session: RetrievedSession = response
            .json()
            .await
            .map_err(|e| CheckoutError::Provider(e.to_string()))?;

        Ok(Some(SessionDetails {
            id: CheckoutSessionId::new(session.id),
            payment_status: session.payment_status,
            customer_email: session
                .customer_details
                .and_then(|details| details.email)
                .or(session.customer_email),
            amount_total: session.amount_total.map(Money::from_cents),
            payment_reference: session.payment_intent,
            metadata: SessionMetadata::from_map(&session.metadata),
        }))
    }
}
