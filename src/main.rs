use std::sync::{Arc, Mutex};

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use phlebo_booking::config::AppConfig;
use phlebo_booking::db;
use phlebo_booking::handlers;
use phlebo_booking::services::gateway::stripe::StripeGateway;
use phlebo_booking::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    anyhow::ensure!(
        !config.stripe_webhook_secret.is_empty(),
        "STRIPE_WEBHOOK_SECRET must be set"
    );
    if config.stripe_secret_key.is_empty() {
        tracing::warn!("STRIPE_SECRET_KEY is empty, gateway calls will be rejected");
    }

    let conn = db::init_db(&config.database_url)?;

    let gateway = StripeGateway::new(
        config.stripe_api_base.clone(),
        config.stripe_secret_key.clone(),
        config.gateway_timeout,
    )?;
    tracing::info!(
        api_base = %config.stripe_api_base,
        currency = %config.currency,
        "using Stripe payment gateway"
    );

    let state = Arc::new(AppState {
        db: Arc::new(Mutex::new(conn)),
        config: config.clone(),
        gateway: Box::new(gateway),
    });

    let app = handlers::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
