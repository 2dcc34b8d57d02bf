//! Checkout totals.

use common::Money;
use item_store::ItemRecord;
use serde::{Deserialize, Serialize};

/// Flat shipping plus a percentage tax on the subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub shipping_flat: Money,
    pub tax_rate_percent: u32,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            shipping_flat: Money::from_cents(500),
            tax_rate_percent: 20,
        }
    }
}

/// Totals for a set of items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub subtotal: Money,
    pub shipping: Money,
    pub tax: Money,
    pub total: Money,
}

impl PricingPolicy {
    /// Prices `items` at their stored prices. An empty set costs nothing.
    pub fn quote(&self, items: &[ItemRecord]) -> Quote {
        let subtotal: Money = items.iter().map(|item| item.price).sum();
        let shipping = if items.is_empty() {
            Money::zero()
        } else {
            self.shipping_flat
        };
        let tax = subtotal.percent(self.tax_rate_percent);

        Quote {
            subtotal,
            shipping,
            tax,
            total: subtotal + shipping + tax,
        }
    }
}
