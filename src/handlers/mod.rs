pub mod bookings;
pub mod health;
pub mod webhook;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/bookings/draft", post(bookings::create_draft))
        .route("/bookings/payment-intent", post(bookings::create_payment_intent))
        .route("/bookings/confirm", post(bookings::confirm_booking))
        .route("/bookings/:id", get(bookings::get_booking))
        .route("/webhooks/payment", post(webhook::payment_webhook))
        .with_state(state)
}
