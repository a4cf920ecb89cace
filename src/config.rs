use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub currency: String,
    pub stripe_secret_key: String,
    pub stripe_api_base: String,
    pub stripe_webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub gateway_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "phlebo_booking.db".to_string()),
            currency: env::var("CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or_else(|_| "usd".to_string()),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            stripe_api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            webhook_tolerance_secs: env::var("WEBHOOK_TOLERANCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            gateway_timeout: Duration::from_millis(
                env::var("GATEWAY_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10_000),
            ),
        }
    }
}
