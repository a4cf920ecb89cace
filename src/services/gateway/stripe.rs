use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{
    ChargeDetails, CreateIntentRequest, CreatedIntent, IntentSnapshot, IntentStatus,
    PaymentError, PaymentGateway,
};

pub struct StripeGateway {
    api_base: String,
    secret_key: String,
    client: reqwest::Client,
}

impl StripeGateway {
    pub fn new(api_base: String, secret_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Stripe HTTP client")?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key,
            client,
        })
    }

    async fn read_intent(resp: reqwest::Response) -> anyhow::Result<RawPaymentIntent> {
        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .context("failed to parse Stripe response")?;

        if !status.is_success() {
            let message = data["error"]["message"].as_str().unwrap_or("unknown error");
            anyhow::bail!("Stripe API error ({status}): {message}");
        }

        serde_json::from_value(data).context("malformed payment intent from Stripe")
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(&self, request: &CreateIntentRequest) -> anyhow::Result<CreatedIntent> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), request.amount_minor.to_string()),
            ("currency".to_string(), request.currency.clone()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        for (key, value) in &request.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }

        let resp = self
            .client
            .post(format!("{}/payment_intents", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .context("failed to call Stripe API")?;

        let intent = Self::read_intent(resp).await?;
        let client_secret = intent
            .client_secret
            .ok_or_else(|| anyhow::anyhow!("missing client_secret in Stripe response"))?;

        Ok(CreatedIntent {
            intent_id: intent.id,
            client_secret,
        })
    }

    async fn get_intent(&self, intent_id: &str) -> anyhow::Result<IntentSnapshot> {
        let resp = self
            .client
            .get(format!("{}/payment_intents/{intent_id}", self.api_base))
            .bearer_auth(&self.secret_key)
            .query(&[("expand[]", "latest_charge")])
            .send()
            .await
            .context("failed to call Stripe API")?;

        Ok(Self::read_intent(resp).await?.into_snapshot())
    }
}

/// Parses a `payment_intent` object, as found in API responses and in `data.object` of
/// webhook events.
pub fn parse_intent_object(object: Value) -> anyhow::Result<IntentSnapshot> {
    let raw: RawPaymentIntent =
        serde_json::from_value(object).context("malformed payment intent object")?;
    Ok(raw.into_snapshot())
}

#[derive(Debug, Deserialize)]
struct RawPaymentIntent {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    latest_charge: Option<Value>,
    #[serde(default)]
    charges: Option<RawChargeList>,
    #[serde(default)]
    payment_method_types: Vec<String>,
    #[serde(default)]
    last_payment_error: Option<PaymentError>,
}

#[derive(Debug, Deserialize)]
struct RawChargeList {
    #[serde(default)]
    data: Vec<Value>,
}

impl RawPaymentIntent {
    fn into_snapshot(self) -> IntentSnapshot {
        // Older API versions embed charges as a list instead of `latest_charge`.
        let charge = self
            .latest_charge
            .as_ref()
            .filter(|c| !c.is_null())
            .or_else(|| self.charges.as_ref().and_then(|list| list.data.first()));

        let method_from_charge = charge
            .and_then(|c| c["payment_method_details"]["type"].as_str())
            .map(str::to_string);

        IntentSnapshot {
            intent_id: self.id,
            status: IntentStatus::from(self.status.as_str()),
            amount_minor: self.amount,
            currency: self.currency,
            payment_method_type: method_from_charge
                .or_else(|| self.payment_method_types.into_iter().next()),
            charge: charge.map(charge_details).unwrap_or_default(),
            last_error: self.last_payment_error,
        }
    }
}

fn charge_details(charge: &Value) -> ChargeDetails {
    match charge {
        Value::String(id) => ChargeDetails {
            charge_id: Some(id.clone()),
            ..ChargeDetails::default()
        },
        Value::Object(_) => {
            let card = &charge["payment_method_details"]["card"];
            ChargeDetails {
                charge_id: charge["id"].as_str().map(str::to_string),
                brand: card["brand"].as_str().map(str::to_string),
                last4: card["last4"].as_str().map(str::to_string),
            }
        }
        _ => ChargeDetails::default(),
    }
}
