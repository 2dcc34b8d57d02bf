//! HTTP API server for the reservation service.
//!
//! Exposes reservation, checkout, payment webhook and order endpoints, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{AppState, Store};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Store>(state: Arc<AppState<S>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::system::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::system::health::<S>))
        .route("/api/items", get(routes::items::list::<S>))
        .route("/api/items/availability", get(routes::items::availability::<S>))
        .route("/api/items/{id}", get(routes::items::get::<S>))
        .route(
            "/api/reservations",
            post(routes::reservations::reserve::<S>).get(routes::reservations::held::<S>),
        )
        .route(
            "/api/reservations/release",
            post(routes::reservations::release::<S>),
        )
        .route(
            "/api/reservations/release-beacon",
            post(routes::reservations::release_beacon::<S>),
        )
        .route("/api/checkout/sessions", post(routes::checkout::create::<S>))
        .route(
            "/api/checkout/sessions/{id}",
            get(routes::checkout::verify::<S>),
        )
        .route("/api/webhooks/payments", post(routes::webhooks::payments::<S>))
        .route("/api/orders", get(routes::orders::list::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
