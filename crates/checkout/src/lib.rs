//! Checkout layer for the reservation service.
//!
//! A checkout spans an external redirect, so it is orchestrated in steps with
//! compensating releases on failure:
//! 1. Reserve every item in the cart (roll back the reserved subset on conflict)
//! 2. Create a payment session with the provider (release on failure)
//! 3. Record the session → reservation mapping for the completion handler
//!
//! The provider later reports the outcome through a signed webhook, which
//! [`PaymentCompletionHandler`] turns into exactly one order. On the client
//! side, [`AbandonmentDetector`] releases holds the shopper walks away from.

pub mod abandonment;
pub mod coordinator;
pub mod error;
pub mod pricing;
pub mod provider;
pub mod signature;
pub mod state;
pub mod webhook;

pub use abandonment::{
    AbandonmentDetector, Delivery, DetectorState, HttpReleaseSignal, ReleaseRequest,
    ReleaseSignal, Trigger,
};
pub use coordinator::{
    BatchReservation, CartLine, CheckoutConfig, CheckoutCoordinator, CheckoutOutcome,
    CheckoutRequest, SessionVerification,
};
pub use error::{CheckoutError, Result};
pub use pricing::{PricingPolicy, Quote};
pub use provider::{
    HttpPaymentProvider, InMemoryPaymentProvider, PaymentProvider, PaymentStatus,
    ProviderSession, SessionDetails, SessionLineItem, SessionMetadata, SessionRequest,
};
pub use signature::{SIGNATURE_HEADER, SignatureError, SignatureVerifier};
pub use state::BatchState;
pub use webhook::{CompletionOutcome, PaymentCompletionHandler, PaymentEvent, PaymentEventKind};
