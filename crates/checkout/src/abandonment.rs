//! Client-side abandonment detection.
//!
//! A shopper who walks away from checkout should give their holds back
//! promptly instead of waiting out the TTL. The detector is a small state
//! machine owned by the client:
//!
//! ```text
//! Disarmed ──► Arming ──► Armed ──► Redirecting
//!    ▲           │          │  ▲         │
//!    └───────────┘          │  └─────────┘ returned without paying
//!    ◄──────────────────────┘ release fired / payment confirmed
//! ```
//!
//! Release is best effort. Inventory correctness never depends on it: lapsed
//! holds are reclaimed by the server regardless.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{Clock, HolderId, ItemId, SystemClock};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{CheckoutError, Result};
use crate::state::BatchState;

/// Detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DetectorState {
    /// Nothing is held, or the hold has already been given up.
    #[default]
    Disarmed,
    /// A reserve call is in flight.
    Arming,
    /// A live hold exists and leaving the page releases it.
    Armed,
    /// The shopper is on the provider's payment page; release is suppressed.
    Redirecting,
}

/// How a release is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// An ordinary request whose response is awaited.
    Request,
    /// Fire and forget. Must survive the page going away.
    Beacon,
}

/// What made the detector fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The shopper confirmed they want to leave checkout.
    LeaveConfirmed,
    /// The tab or window is being closed.
    PageHidden,
    /// The local countdown reached zero.
    TimerElapsed,
}

impl Trigger {
    fn delivery(&self) -> Delivery {
        match self {
            Trigger::PageHidden => Delivery::Beacon,
            Trigger::LeaveConfirmed | Trigger::TimerElapsed => Delivery::Request,
        }
    }

    fn final_state(&self) -> BatchState {
        match self {
            Trigger::TimerElapsed => BatchState::Expired,
            Trigger::LeaveConfirmed | Trigger::PageHidden => BatchState::Released,
        }
    }
}

/// Body of a release call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub item_ids: Vec<ItemId>,
    pub holder_id: HolderId,
}

/// Sends release calls to the server.
#[async_trait]
pub trait ReleaseSignal: Send + Sync {
    async fn send(&self, request: ReleaseRequest, delivery: Delivery) -> Result<()>;
}

#[async_trait]
impl<R: ReleaseSignal + ?Sized> ReleaseSignal for Arc<R> {
    async fn send(&self, request: ReleaseRequest, delivery: Delivery) -> Result<()> {
        (**self).send(request, delivery).await
    }
}

/// Releases a holder's batch when checkout is abandoned.
///
/// At most one release is emitted per armed hold.
pub struct AbandonmentDetector<R: ReleaseSignal> {
    signal: R,
    clock: Arc<dyn Clock>,
    holder: HolderId,
    state: DetectorState,
    batch: BatchState,
    item_ids: Vec<ItemId>,
    reserved_until: Option<DateTime<Utc>>,
}

impl<R: ReleaseSignal> AbandonmentDetector<R> {
    pub fn new(signal: R, holder: HolderId) -> Self {
        Self::with_clock(signal, holder, Arc::new(SystemClock))
    }

    pub fn with_clock(signal: R, holder: HolderId, clock: Arc<dyn Clock>) -> Self {
        Self {
            signal,
            clock,
            holder,
            state: DetectorState::Disarmed,
            batch: BatchState::None,
            item_ids: Vec::new(),
            reserved_until: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn batch_state(&self) -> BatchState {
        self.batch
    }

    pub fn reserved_until(&self) -> Option<DateTime<Utc>> {
        self.reserved_until
    }

    /// Starts a reserve call. Returns false if a batch is already in flight
    /// or held.
    pub fn begin_reserving(&mut self, item_ids: Vec<ItemId>) -> bool {
        if !self.batch.can_reserve() {
            return false;
        }
        self.item_ids = item_ids;
        self.reserved_until = None;
        self.state = DetectorState::Arming;
        self.batch = BatchState::Reserving;
        true
    }

    /// The server confirmed the hold.
    pub fn reservation_confirmed(&mut self, reserved_until: DateTime<Utc>) {
        if self.state != DetectorState::Arming {
            return;
        }
        self.reserved_until = Some(reserved_until);
        self.state = DetectorState::Armed;
        self.batch = BatchState::Held;
    }

    /// The server reported a conflict. Nothing is held.
    pub fn reservation_failed(&mut self) {
        if self.state != DetectorState::Arming {
            return;
        }
        self.item_ids.clear();
        self.state = DetectorState::Disarmed;
        self.batch = BatchState::None;
    }

    /// The shopper is being sent to the payment page.
    pub fn redirecting(&mut self) {
        if self.state == DetectorState::Armed {
            self.state = DetectorState::Redirecting;
        }
    }

    /// The shopper came back to checkout without paying. Re-arms if the hold
    /// is still live.
    pub fn returned_without_payment(&mut self) {
        if self.state != DetectorState::Redirecting {
            return;
        }
        if self.remaining().is_some_and(|left| left > Duration::zero()) {
            self.state = DetectorState::Armed;
        } else {
            self.state = DetectorState::Disarmed;
            self.batch = BatchState::Expired;
        }
    }

    /// The server confirmed payment; the items are sold.
    pub fn payment_confirmed(&mut self) {
        if matches!(
            self.state,
            DetectorState::Armed | DetectorState::Redirecting
        ) {
            self.state = DetectorState::Disarmed;
            self.batch = BatchState::Committed;
        }
    }

    /// Time left on the hold, while one is being tracked.
    pub fn remaining(&self) -> Option<Duration> {
        if !matches!(
            self.state,
            DetectorState::Armed | DetectorState::Redirecting
        ) {
            return None;
        }
        let until = self.reserved_until?;
        Some((until - self.clock.now()).max(Duration::zero()))
    }

    /// Reacts to an abandonment trigger. Returns the delivery used, or None
    /// when nothing was sent.
    #[tracing::instrument(skip(self), fields(holder = %self.holder, state = ?self.state))]
    pub async fn on_trigger(&mut self, trigger: Trigger) -> Option<Delivery> {
        if self.state != DetectorState::Armed {
            return None;
        }

        self.state = DetectorState::Disarmed;
        self.batch = trigger.final_state();

        let delivery = trigger.delivery();
        let request = ReleaseRequest {
            item_ids: std::mem::take(&mut self.item_ids),
            holder_id: self.holder.clone(),
        };
        if let Err(e) = self.signal.send(request, delivery).await {
            // The server reclaims the hold at expiry anyway.
            tracing::warn!(error = %e, "release signal failed");
        }
        Some(delivery)
    }

    /// Checks the local countdown; fires a release once it reaches zero.
    pub async fn tick(&mut self) -> Option<Delivery> {
        if self.state == DetectorState::Armed && self.remaining() == Some(Duration::zero()) {
            return self.on_trigger(Trigger::TimerElapsed).await;
        }
        None
    }
}

/// Sends releases to the reservation API over HTTP.
#[derive(Clone, Debug)]
pub struct HttpReleaseSignal {
    base_url: String,
    http_client: Client,
}

impl HttpReleaseSignal {
    pub fn new(base_url: impl Into<String>, timeout: StdDuration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CheckoutError::ReleaseSignal(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl ReleaseSignal for HttpReleaseSignal {
    async fn send(&self, request: ReleaseRequest, delivery: Delivery) -> Result<()> {
        match delivery {
            Delivery::Request => {
                let response = self
                    .http_client
                    .post(format!("{}/api/reservations/release", self.base_url))
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| CheckoutError::ReleaseSignal(e.to_string()))?;

                if !response.status().is_success() {
                    return Err(CheckoutError::ReleaseSignal(format!(
                        "release returned {}",
                        response.status()
                    )));
                }
                Ok(())
            }
            Delivery::Beacon => {
                // Beacons carry text/plain bodies and nobody reads the reply.
                let body = serde_json::to_vec(&request)?;
                let post = self
                    .http_client
                    .post(format!("{}/api/reservations/release-beacon", self.base_url))
                    .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
                    .body(body);
                tokio::spawn(async move {
                    if let Err(e) = post.send().await {
                        tracing::debug!(error = %e, "release beacon not delivered");
                    }
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::routing::post;
    use common::ManualClock;

    use super::*;

    #[derive(Default)]
    struct RecordingSignal {
        sent: Mutex<Vec<(ReleaseRequest, Delivery)>>,
    }

    impl RecordingSignal {
        fn sent(&self) -> Vec<(ReleaseRequest, Delivery)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReleaseSignal for RecordingSignal {
        async fn send(&self, request: ReleaseRequest, delivery: Delivery) -> Result<()> {
            self.sent.lock().unwrap().push((request, delivery));
            Ok(())
        }
    }

    fn armed() -> (
        AbandonmentDetector<Arc<RecordingSignal>>,
        Arc<RecordingSignal>,
        ManualClock,
    ) {
        let signal = Arc::new(RecordingSignal::default());
        let clock = ManualClock::new(Utc::now());
        let mut detector = AbandonmentDetector::with_clock(
            Arc::clone(&signal),
            HolderId::new("x"),
            Arc::new(clock.clone()),
        );
        assert!(detector.begin_reserving(vec![ItemId::new("A"), ItemId::new("B")]));
        detector.reservation_confirmed(clock.now() + Duration::hours(1));
        (detector, signal, clock)
    }

    #[tokio::test]
    async fn test_leave_fires_once() {
        let (mut detector, signal, _) = armed();

        assert_eq!(
            detector.on_trigger(Trigger::LeaveConfirmed).await,
            Some(Delivery::Request)
        );
        assert_eq!(detector.on_trigger(Trigger::PageHidden).await, None);

        let sent = signal.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.item_ids, vec![ItemId::new("A"), ItemId::new("B")]);
        assert_eq!(detector.batch_state(), BatchState::Released);
    }

    #[tokio::test]
    async fn test_page_hidden_uses_beacon() {
        let (mut detector, signal, _) = armed();

        detector.on_trigger(Trigger::PageHidden).await;

        assert_eq!(signal.sent()[0].1, Delivery::Beacon);
    }

    #[tokio::test]
    async fn test_redirect_suppresses_release() {
        let (mut detector, signal, _) = armed();
        detector.redirecting();

        assert_eq!(detector.on_trigger(Trigger::PageHidden).await, None);
        assert!(signal.sent().is_empty());
        assert_eq!(detector.batch_state(), BatchState::Held);
    }

    #[tokio::test]
    async fn test_return_without_payment_rearms() {
        let (mut detector, signal, clock) = armed();
        detector.redirecting();
        clock.advance(Duration::minutes(10));

        detector.returned_without_payment();
        assert_eq!(detector.state(), DetectorState::Armed);

        detector.on_trigger(Trigger::LeaveConfirmed).await;
        assert_eq!(signal.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_return_after_expiry_stays_disarmed() {
        let (mut detector, _, clock) = armed();
        detector.redirecting();
        clock.advance(Duration::minutes(61));

        detector.returned_without_payment();

        assert_eq!(detector.state(), DetectorState::Disarmed);
        assert_eq!(detector.batch_state(), BatchState::Expired);
    }

    #[tokio::test]
    async fn test_timer_fires_at_zero() {
        let (mut detector, signal, clock) = armed();

        clock.advance(Duration::minutes(59));
        assert_eq!(detector.tick().await, None);
        assert_eq!(detector.remaining(), Some(Duration::minutes(1)));

        clock.advance(Duration::minutes(2));
        assert_eq!(detector.tick().await, Some(Delivery::Request));
        assert_eq!(detector.batch_state(), BatchState::Expired);
        assert_eq!(signal.sent().len(), 1);
        assert_eq!(detector.remaining(), None);
    }

    #[tokio::test]
    async fn test_payment_confirmed_disarms() {
        let (mut detector, signal, _) = armed();
        detector.redirecting();

        detector.payment_confirmed();

        assert_eq!(detector.batch_state(), BatchState::Committed);
        assert_eq!(detector.on_trigger(Trigger::PageHidden).await, None);
        assert!(signal.sent().is_empty());
        assert!(detector.begin_reserving(vec![ItemId::new("C")]));
    }

    #[tokio::test]
    async fn test_failed_reservation_never_arms() {
        let signal = Arc::new(RecordingSignal::default());
        let mut detector = AbandonmentDetector::new(Arc::clone(&signal), HolderId::new("x"));
        detector.begin_reserving(vec![ItemId::new("A")]);
        assert!(!detector.begin_reserving(vec![ItemId::new("B")]));

        detector.reservation_failed();

        assert_eq!(detector.state(), DetectorState::Disarmed);
        assert_eq!(detector.on_trigger(Trigger::LeaveConfirmed).await, None);
        assert!(signal.sent().is_empty());
    }

    #[tokio::test]
    async fn test_http_signal_posts_release() {
        type Received = Arc<Mutex<Vec<ReleaseRequest>>>;

        async fn release(State(received): State<Received>, body: Bytes) {
            let request: ReleaseRequest = serde_json::from_slice(&body).unwrap();
            received.lock().unwrap().push(request);
        }

        let received: Received = Arc::default();
        let app = Router::new()
            .route("/api/reservations/release", post(release))
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let signal = HttpReleaseSignal::new(format!("http://{addr}"), StdDuration::from_secs(5)).unwrap();
        let request = ReleaseRequest {
            item_ids: vec![ItemId::new("A")],
            holder_id: HolderId::new("x"),
        };
        signal.send(request.clone(), Delivery::Request).await.unwrap();

        assert_eq!(received.lock().unwrap().clone(), vec![request]);
    }

    #[test]
    fn test_release_request_is_camel_case() {
        let json = serde_json::to_value(ReleaseRequest {
            item_ids: vec![ItemId::new("A")],
            holder_id: HolderId::new("x"),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "itemIds": ["A"], "holderId": "x" }));
    }
}
