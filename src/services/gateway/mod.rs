pub mod stripe;
pub mod webhook;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CreatedIntent {
    pub intent_id: String,
    pub client_secret: String,
}

/// The gateway's authoritative view of an intent.
#[derive(Debug, Clone)]
pub struct IntentSnapshot {
    pub intent_id: String,
    pub status: IntentStatus,
    pub amount_minor: i64,
    pub currency: String,
    pub payment_method_type: Option<String>,
    pub charge: ChargeDetails,
    pub last_error: Option<PaymentError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargeDetails {
    pub charge_id: Option<String>,
    pub brand: Option<String>,
    pub last4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentError {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    Unknown(String),
}

impl From<&str> for IntentStatus {
    fn from(s: &str) -> Self {
        match s {
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_action" => Self::RequiresAction,
            "processing" => Self::Processing,
            "requires_capture" => Self::RequiresCapture,
            "canceled" => Self::Canceled,
            "succeeded" => Self::Succeeded,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl IntentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresAction => "requires_action",
            Self::Processing => "processing",
            Self::RequiresCapture => "requires_capture",
            Self::Canceled => "canceled",
            Self::Succeeded => "succeeded",
            Self::Unknown(other) => other,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, request: &CreateIntentRequest) -> anyhow::Result<CreatedIntent>;

    async fn get_intent(&self, intent_id: &str) -> anyhow::Result<IntentSnapshot>;
}

/// Runs a gateway call under `limit`. Nothing is written before the call returns, so a
/// timeout leaves no partial state behind.
pub async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, AppError> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AppError::Gateway(format!("{e:#}"))),
        Err(_) => Err(AppError::GatewayTimeout),
    }
}
