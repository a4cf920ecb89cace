use chrono::NaiveDateTime;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::queries;
use crate::errors::AppError;
use crate::models::money;
use crate::models::{Booking, BookingStatus};
use crate::services::confirmation;
use crate::services::gateway::{self, CreateIntentRequest, IntentStatus};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct IssuedIntent {
    pub booking_id: String,
    pub intent_id: String,
    pub client_secret: String,
    pub amount: Decimal,
    pub amount_minor: i64,
    pub currency: String,
}

/// Loads a draft for its owner and runs the draft preconditions in order: ownership, token,
/// expiry, status. A booking that is no longer a draft reports its status instead.
pub fn load_draft(
    conn: &Connection,
    patient_id: &str,
    booking_id: &str,
    draft_token: &str,
    now: NaiveDateTime,
) -> Result<Booking, AppError> {
    let booking = queries::get_booking(conn, booking_id)?
        .filter(|b| b.patient_id == patient_id)
        .ok_or_else(|| AppError::BookingNotFound(booking_id.to_string()))?;

    match booking.draft_token.as_deref() {
        Some(token) if token == draft_token => {}
        Some(_) => return Err(AppError::BookingNotFound(booking_id.to_string())),
        None => return Err(AppError::InvalidState(booking.status)),
    }

    if booking.is_expired(now) {
        return Err(AppError::DraftExpired);
    }
    if booking.status != BookingStatus::Pending {
        return Err(AppError::InvalidState(booking.status));
    }

    Ok(booking)
}

/// Requests a new intent for the draft's total and stores its id on the booking.
///
/// An earlier intent is replaced only once the gateway reports it can no longer take money.
/// If it already succeeded the payment is reconciled and the booking confirmed; if it is
/// still being worked on the request is refused. The db lock is released while the gateway
/// is called, so the draft is re-checked before the write.
pub async fn issue_intent(
    state: &AppState,
    patient_id: &str,
    booking_id: &str,
    draft_token: &str,
    now: NaiveDateTime,
) -> Result<IssuedIntent, AppError> {
    let booking = {
        let db = state.db()?;
        load_draft(&db, patient_id, booking_id, draft_token, now)?
    };

    if let Some(previous) = booking.stripe_payment_intent_id.as_deref() {
        let existing = gateway::bounded(
            state.config.gateway_timeout,
            state.gateway.get_intent(previous),
        )
        .await?;

        match existing.status {
            IntentStatus::RequiresPaymentMethod
            | IntentStatus::RequiresConfirmation
            | IntentStatus::Canceled => {}
            IntentStatus::Succeeded => {
                tracing::warn!(
                    booking_id,
                    intent_id = previous,
                    "earlier intent already paid, confirming instead of replacing"
                );
                let mut db = state.db()?;
                let confirmed = confirmation::reconcile(&mut db, booking_id, &existing, now)?;
                return Err(AppError::InvalidState(confirmed.booking.status));
            }
            _ => {
                tracing::info!(
                    booking_id,
                    intent_id = previous,
                    status = existing.status.as_str(),
                    "earlier intent still in flight, not replacing"
                );
                return Err(AppError::PaymentInProgress(previous.to_string()));
            }
        }
    }

    let amount_minor = money::to_minor_units(booking.grand_total_cost).ok_or_else(|| {
        AppError::Internal(format!(
            "booking total {} does not fit minor units",
            booking.grand_total_cost
        ))
    })?;

    let request = CreateIntentRequest {
        amount_minor,
        currency: booking.currency.clone(),
        metadata: vec![
            ("booking_id".to_string(), booking.id.clone()),
            ("patient_id".to_string(), booking.patient_id.clone()),
        ],
    };

    let created = gateway::bounded(
        state.config.gateway_timeout,
        state.gateway.create_intent(&request),
    )
    .await?;

    {
        let mut db = state.db()?;
        let tx = db.transaction()?;

        let current = load_draft(&tx, patient_id, booking_id, draft_token, now)?;
        if current.stripe_payment_intent_id != booking.stripe_payment_intent_id {
            // Another request attached an intent while this one was at the gateway.
            tracing::info!(
                booking_id,
                intent_id = %created.intent_id,
                "intent changed during issue, abandoning new intent"
            );
            return Err(AppError::PaymentInProgress(
                current.stripe_payment_intent_id.unwrap_or_default(),
            ));
        }
        if let Some(previous) = current.stripe_payment_intent_id.as_deref() {
            tracing::info!(
                booking_id,
                previous_intent = previous,
                intent_id = %created.intent_id,
                "replacing payment intent"
            );
        }

        if !queries::attach_payment_intent(&tx, booking_id, draft_token, &created.intent_id, &now)? {
            return Err(AppError::InvalidState(current.status));
        }
        tx.commit()?;
    }

    tracing::info!(
        booking_id,
        intent_id = %created.intent_id,
        amount_minor,
        "payment intent issued"
    );

    Ok(IssuedIntent {
        booking_id: booking.id,
        intent_id: created.intent_id,
        client_secret: created.client_secret,
        amount: booking.grand_total_cost,
        amount_minor,
        currency: booking.currency,
    })
}
