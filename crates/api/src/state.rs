//! Shared application state.

use std::sync::Arc;

use checkout::{
    CheckoutCoordinator, CheckoutError, HttpPaymentProvider, InMemoryPaymentProvider,
    PaymentCompletionHandler, PaymentProvider, SignatureVerifier,
};
use common::{Clock, SystemClock};
use item_store::{CheckoutSessionStore, ItemStore, OrderStore};
use reservation::ReservationEngine;

use crate::config::Config;

/// Everything a backend must provide to serve the API.
pub trait Store: ItemStore + OrderStore + CheckoutSessionStore + 'static {}

impl<T: ItemStore + OrderStore + CheckoutSessionStore + 'static> Store for T {}

/// Payment provider chosen at startup.
pub type Provider = Arc<dyn PaymentProvider>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: Store> {
    pub engine: Arc<ReservationEngine<S>>,
    pub coordinator: CheckoutCoordinator<S, Provider>,
    pub webhooks: PaymentCompletionHandler<S>,
}

impl<S: Store> AppState<S> {
    /// Wires the engine, coordinator and webhook handler over one store.
    pub fn new(store: S, provider: Provider, config: &Config) -> Self {
        Self::with_clock(store, provider, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, provider: Provider, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let engine = Arc::new(ReservationEngine::with_clock(store, clock));
        let coordinator = CheckoutCoordinator::new(Arc::clone(&engine), provider, config.checkout());
        let webhooks = PaymentCompletionHandler::new(
            Arc::clone(&engine),
            SignatureVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance_secs),
        );

        Self {
            engine,
            coordinator,
            webhooks,
        }
    }
}

/// The HTTP provider when a base URL is configured, otherwise the in-memory one.
pub fn build_provider(config: &Config) -> Result<Provider, CheckoutError> {
    match &config.payment_api_base {
        Some(base) => {
            let provider = HttpPaymentProvider::new(
                base.clone(),
                config.payment_api_key.clone(),
                config.payment_timeout(),
            )?;
            tracing::info!(base = %base, "using HTTP payment provider");
            Ok(Arc::new(provider))
        }
        None => {
            tracing::warn!("PAYMENT_API_BASE not set, using in-memory payment provider");
            Ok(Arc::new(InMemoryPaymentProvider::new()))
        }
    }
}
