//! Webhook authenticity checks.
//!
//! The provider signs each delivery with a header of the form
//! `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>…]`, where every `v1` is
//! HMAC-SHA256 over `"{t}.{raw body}"` keyed with the endpoint secret. More
//! than one `v1` appears while secrets are being rotated; any match is enough.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Request header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "Payment-Signature";

/// Why a webhook signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("no webhook secret is configured")]
    NotConfigured,

    #[error("missing Payment-Signature header")]
    MissingHeader,

    #[error("malformed signature header")]
    Malformed,

    #[error("signature timestamp is {skew_secs}s away from now, tolerance is {tolerance_secs}s")]
    OutsideTolerance { skew_secs: i64, tolerance_secs: i64 },

    #[error("no signature matches the payload")]
    Mismatch,
}

/// Verifies (and, for tests and tooling, produces) webhook signatures.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Checks `header` against `payload` at time `now`.
    pub fn verify(
        &self,
        payload: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        if self.secret.is_empty() {
            return Err(SignatureError::NotConfigured);
        }
        let header = header.ok_or(SignatureError::MissingHeader)?;

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?)
                }
                Some(("v1", value)) => candidates.push(value),
                // Other schemes (v0 test signatures) are ignored.
                Some(_) => {}
                None => return Err(SignatureError::Malformed),
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if candidates.is_empty() {
            return Err(SignatureError::Malformed);
        }

        let skew_secs = (now.timestamp() - timestamp).abs();
        if self.tolerance_secs > 0 && skew_secs > self.tolerance_secs {
            return Err(SignatureError::OutsideTolerance {
                skew_secs,
                tolerance_secs: self.tolerance_secs,
            });
        }

        let mac = self.mac_for(timestamp, payload)?;
        let matched = candidates.into_iter().any(|candidate| {
            hex::decode(candidate)
                .map(|expected| mac.clone().verify_slice(&expected).is_ok())
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Builds the header value the provider would send for `payload`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
        let mac = self.mac_for(timestamp, payload)?;
        Ok(format!(
            "t={timestamp},v1={}",
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SignatureError::NotConfigured)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}
