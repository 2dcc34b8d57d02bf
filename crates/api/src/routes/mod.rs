//! HTTP route handlers.

pub mod checkout;
pub mod items;
pub mod orders;
pub mod reservations;
pub mod system;
pub mod webhooks;
