use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::Booking;
use crate::services::booking_view::{self, BookingView};
use crate::services::draft::{self, DraftReceipt, DraftRequest};
use crate::services::{confirmation, intent};
use crate::state::AppState;

/// Set by the upstream auth layer.
pub const PATIENT_HEADER: &str = "x-patient-id";

fn caller(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(PATIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("missing patient identity".to_string()))
}

fn now() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

// POST /bookings/draft
pub async fn create_draft(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DraftRequest>,
) -> Result<(StatusCode, Json<DraftReceipt>), AppError> {
    let patient_id = caller(&headers)?;

    let receipt = {
        let mut db = state.db()?;
        draft::create_draft(&mut db, &patient_id, &request, &state.config.currency, now())?
    };

    Ok((StatusCode::CREATED, Json(receipt)))
}

// POST /bookings/payment-intent
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentRequest {
    pub booking_id: String,
    pub draft_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    client_secret: String,
    payment_intent_id: String,
    amount: Decimal,
    currency: String,
}

pub async fn create_payment_intent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PaymentIntentRequest>,
) -> Result<Json<PaymentIntentResponse>, AppError> {
    let patient_id = caller(&headers)?;

    let issued = intent::issue_intent(
        &state,
        &patient_id,
        &request.booking_id,
        &request.draft_token,
        now(),
    )
    .await?;

    Ok(Json(PaymentIntentResponse {
        client_secret: issued.client_secret,
        payment_intent_id: issued.intent_id,
        amount: issued.amount,
        currency: issued.currency,
    }))
}

// POST /bookings/confirm
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub booking_id: String,
    pub payment_intent_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    confirmation_number: Option<String>,
    booking: Booking,
}

pub async fn confirm_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, AppError> {
    let patient_id = caller(&headers)?;

    let confirmation = confirmation::confirm_from_client(
        &state,
        &patient_id,
        &request.booking_id,
        &request.payment_intent_id,
        now(),
    )
    .await?;

    Ok(Json(ConfirmResponse {
        confirmation_number: confirmation.booking.confirmation_number.clone(),
        booking: confirmation.booking,
    }))
}

// GET /bookings/:id
#[derive(Deserialize)]
pub struct BookingQuery {
    pub draft_token: Option<String>,
}

pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<BookingQuery>,
) -> Result<Json<BookingView>, AppError> {
    let patient_id = caller(&headers)?;

    let view = {
        let db = state.db()?;
        booking_view::load(&db, &patient_id, &id, query.draft_token.as_deref())?
    };

    Ok(Json(view))
}
