//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use checkout::{CheckoutConfig, PricingPolicy};
use common::Money;
use thiserror::Error;

/// A variable was set to something that does not parse or is out of range.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `pretty` or `json`
/// - `DATABASE_URL`: PostgreSQL; unset runs on the in-memory store
/// - `HOLD_TTL_SECS`, `SWEEP_INTERVAL_SECS`: hold lifetime and sweep period
/// - `PAYMENT_API_BASE`, `PAYMENT_API_KEY`, `PAYMENT_TIMEOUT_SECS`: provider
///   client; with no base URL the in-memory provider is used
/// - `WEBHOOK_SECRET`, `WEBHOOK_TOLERANCE_SECS`: webhook signatures
/// - `CHECKOUT_SUCCESS_URL`, `CHECKOUT_CANCEL_URL`, `CURRENCY`,
///   `SHIPPING_FLAT_CENTS`, `TAX_RATE_PERCENT`: checkout session contents
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub hold_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub payment_api_base: Option<String>,
    pub payment_api_key: String,
    pub payment_timeout_secs: u64,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub success_url: String,
    pub cancel_url: String,
    pub currency: String,
    pub shipping_flat_cents: i64,
    pub tax_rate_percent: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Ok(Self {
            host: text("HOST", defaults.host),
            port: parsed(&lookup, "PORT", defaults.port)?,
            log_level: text("RUST_LOG", defaults.log_level),
            log_format: parsed(&lookup, "LOG_FORMAT", defaults.log_format)?,
            database_url: optional("DATABASE_URL"),
            hold_ttl_secs: positive(&lookup, "HOLD_TTL_SECS", defaults.hold_ttl_secs)?,
            sweep_interval_secs: positive(&lookup, "SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            payment_api_base: optional("PAYMENT_API_BASE"),
            payment_api_key: text("PAYMENT_API_KEY", defaults.payment_api_key),
            payment_timeout_secs: parsed(&lookup, "PAYMENT_TIMEOUT_SECS", defaults.payment_timeout_secs)?,
            webhook_secret: text("WEBHOOK_SECRET", defaults.webhook_secret),
            webhook_tolerance_secs: parsed(
                &lookup,
                "WEBHOOK_TOLERANCE_SECS",
                defaults.webhook_tolerance_secs,
            )?,
            success_url: text("CHECKOUT_SUCCESS_URL", defaults.success_url),
            cancel_url: text("CHECKOUT_CANCEL_URL", defaults.cancel_url),
            currency: text("CURRENCY", defaults.currency),
            shipping_flat_cents: parsed(&lookup, "SHIPPING_FLAT_CENTS", defaults.shipping_flat_cents)?,
            tax_rate_percent: parsed(&lookup, "TAX_RATE_PERCENT", defaults.tax_rate_percent)?,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    /// Settings for the checkout coordinator.
    pub fn checkout(&self) -> CheckoutConfig {
        let hold_secs = i64::try_from(self.hold_ttl_secs).unwrap_or(i64::MAX);
        CheckoutConfig {
            hold_ttl: chrono::Duration::try_seconds(hold_secs).unwrap_or(chrono::Duration::hours(1)),
            currency: self.currency.clone(),
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
            pricing: PricingPolicy {
                shipping_flat: Money::from_cents(self.shipping_flat_cents),
                tax_rate_percent: self.tax_rate_percent,
            },
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError { key, value }),
    }
}

/// Like [`parsed`], rejecting zero.
fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match parsed(lookup, key, default)? {
        0 => Err(ConfigError {
            key,
            value: "0".to_string(),
        }),
        value => Ok(value),
    }
}

impl Default for Config {
    fn default() -> Self {
        let checkout = CheckoutConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            hold_ttl_secs: 3600,
            sweep_interval_secs: 60,
            payment_api_base: None,
            payment_api_key: String::new(),
            payment_timeout_secs: 10,
            webhook_secret: String::new(),
            webhook_tolerance_secs: 300,
            success_url: checkout.success_url,
            cancel_url: checkout.cancel_url,
            currency: checkout.currency,
            shipping_flat_cents: checkout.pricing.shipping_flat.cents(),
            tax_rate_percent: checkout.pricing.tax_rate_percent,
        }
    }
}
