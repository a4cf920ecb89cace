//! Signed gateway events.
//!
//! The signature header has the form `t=<unix seconds>,v1=<hex>` (several `v1` entries are
//! allowed during secret rotation). Each `v1` is HMAC-SHA256 over `"<t>.<raw body>"`.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use super::stripe::parse_intent_object;
use super::IntentSnapshot;
use crate::errors::AppError;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    PaymentSucceeded { event_id: String, intent: IntentSnapshot },
    PaymentFailed { event_id: String, intent: IntentSnapshot },
    Ignored { event_id: String, event_type: String },
}

impl GatewayEvent {
    pub fn event_id(&self) -> &str {
        match self {
            GatewayEvent::PaymentSucceeded { event_id, .. }
            | GatewayEvent::PaymentFailed { event_id, .. }
            | GatewayEvent::Ignored { event_id, .. } => event_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Nothing in the payload is looked at until the signature checks out.
    pub fn verify_and_parse(
        &self,
        payload: &[u8],
        header: &str,
        now_unix: i64,
    ) -> Result<GatewayEvent, AppError> {
        self.verify_signature(payload, header, now_unix)?;

        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| AppError::Validation(format!("malformed event: {e}")))?;

        tracing::debug!(event_id = %raw.id, event_type = %raw.event_type, "parsed gateway event");

        match raw.event_type.as_str() {
            "payment_intent.succeeded" => Ok(GatewayEvent::PaymentSucceeded {
                intent: parse_object(raw.data.object)?,
                event_id: raw.id,
            }),
            "payment_intent.payment_failed" => Ok(GatewayEvent::PaymentFailed {
                intent: parse_object(raw.data.object)?,
                event_id: raw.id,
            }),
            _ => Ok(GatewayEvent::Ignored {
                event_id: raw.id,
                event_type: raw.event_type,
            }),
        }
    }

    fn verify_signature(&self, payload: &[u8], header: &str, now_unix: i64) -> Result<(), AppError> {
        if self.secret.is_empty() {
            return Err(AppError::Config("webhook secret is not configured".to_string()));
        }

        let mut timestamp: Option<&str> = None;
        let mut signatures: Vec<&str> = vec![];
        for part in header.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = Some(value),
                    "v1" => signatures.push(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| AppError::InvalidSignature("missing timestamp".to_string()))?;
        if signatures.is_empty() {
            return Err(AppError::InvalidSignature("missing v1 signature".to_string()));
        }

        let matched = signatures.iter().any(|sig| {
            let Ok(expected) = hex::decode(sig) else {
                return false;
            };
            let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes()) else {
                return false;
            };
            mac.update(timestamp.as_bytes());
            mac.update(b".");
            mac.update(payload);
            mac.verify_slice(&expected).is_ok()
        });

        if !matched {
            tracing::warn!("webhook signature verification failed");
            return Err(AppError::InvalidSignature("signature mismatch".to_string()));
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| AppError::InvalidSignature("invalid timestamp".to_string()))?;
        if (now_unix - ts).abs() > self.tolerance_secs {
            tracing::warn!(timestamp = ts, now = now_unix, "webhook timestamp outside tolerance");
            return Err(AppError::InvalidSignature("timestamp outside tolerance".to_string()));
        }

        Ok(())
    }
}

fn parse_object(object: Value) -> Result<IntentSnapshot, AppError> {
    parse_intent_object(object).map_err(|e| AppError::Validation(format!("{e:#}")))
}

/// Builds a signature header value for `payload`. Used by tests and local tooling that
/// replays events.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, AppError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}
