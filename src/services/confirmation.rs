//! Confirmation handler and reconciliation ledger.
//!
//! The client path and the webhook path race to confirm the same booking, and the gateway may
//! deliver the same event more than once. Both paths funnel into [`reconcile`], which inserts
//! the Payment row first and only then moves the booking to `Confirmed`, all in one
//! transaction. The unique index on `payments.stripe_payment_intent_id` decides the winner;
//! a loser sees a unique violation and reports the existing confirmation as success.

use chrono::NaiveDateTime;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use rusqlite::Connection;
use serde::Serialize;

use crate::db::queries::{self, PaymentFailure};
use crate::errors::{self, AppError};
use crate::models::money;
use crate::models::{Booking, BookingStatus, Payment, PaymentStatus};
use crate::services::gateway::webhook::GatewayEvent;
use crate::services::gateway::{self, IntentSnapshot, IntentStatus};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct Confirmation {
    pub booking: Booking,
    pub payment: Payment,
    /// True when an earlier attempt had already recorded this payment.
    pub replayed: bool,
}

impl Confirmation {
    pub fn confirmation_number(&self) -> Option<&str> {
        self.booking.confirmation_number.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Confirmed { booking_id: String },
    AlreadyReconciled { booking_id: String },
    FailureRecorded { booking_id: String },
    UnknownIntent,
    Ignored,
}

/// Client-initiated confirmation after the patient believes payment went through. The
/// gateway, not the client, decides whether it did.
pub async fn confirm_from_client(
    state: &AppState,
    patient_id: &str,
    booking_id: &str,
    intent_id: &str,
    now: NaiveDateTime,
) -> Result<Confirmation, AppError> {
    let booking = {
        let db = state.db()?;
        let booking = queries::get_booking(&db, booking_id)?
            .filter(|b| b.patient_id == patient_id)
            .ok_or_else(|| AppError::BookingNotFound(booking_id.to_string()))?;

        if booking.stripe_payment_intent_id.as_deref() != Some(intent_id) {
            return Err(AppError::IntentMismatch);
        }
        if booking.status != BookingStatus::Pending {
            if let Some(existing) = existing_confirmation(&db, booking_id, intent_id)? {
                tracing::info!(booking_id, intent_id, "confirmation replayed");
                return Ok(existing);
            }
            return Err(AppError::InvalidState(booking.status));
        }
        if booking.is_expired(now) {
            return Err(AppError::DraftExpired);
        }
        booking
    };

    let intent = gateway::bounded(
        state.config.gateway_timeout,
        state.gateway.get_intent(intent_id),
    )
    .await?;

    if intent.intent_id != intent_id {
        return Err(AppError::Gateway(format!(
            "gateway returned intent {} for {intent_id}",
            intent.intent_id
        )));
    }
    if intent.status != IntentStatus::Succeeded {
        tracing::info!(
            booking_id,
            intent_id,
            status = intent.status.as_str(),
            "client confirmation before payment succeeded"
        );
        return Err(AppError::PaymentNotSucceeded(intent.status.as_str().to_string()));
    }

    let mut db = state.db()?;
    reconcile(&mut db, &booking.id, &intent, now)
}

/// Applies one verified gateway event.
pub fn handle_event(
    conn: &mut Connection,
    event: &GatewayEvent,
    now: NaiveDateTime,
) -> Result<WebhookOutcome, AppError> {
    match event {
        GatewayEvent::PaymentSucceeded { event_id, intent } => {
            let Some(booking) = queries::get_booking_by_intent(conn, &intent.intent_id)? else {
                tracing::info!(
                    event_id = %event_id,
                    intent_id = %intent.intent_id,
                    "no booking for succeeded intent, acknowledging"
                );
                return Ok(WebhookOutcome::UnknownIntent);
            };

            if queries::get_payment_by_intent(conn, &intent.intent_id)?.is_some() {
                tracing::info!(
                    event_id = %event_id,
                    booking_id = %booking.id,
                    "payment already reconciled"
                );
                return Ok(WebhookOutcome::AlreadyReconciled {
                    booking_id: booking.id,
                });
            }

            let confirmation = reconcile(conn, &booking.id, intent, now)?;
            if confirmation.replayed {
                Ok(WebhookOutcome::AlreadyReconciled {
                    booking_id: booking.id,
                })
            } else {
                Ok(WebhookOutcome::Confirmed {
                    booking_id: booking.id,
                })
            }
        }
        GatewayEvent::PaymentFailed { event_id, intent } => {
            let Some(booking) = queries::get_booking_by_intent(conn, &intent.intent_id)? else {
                tracing::info!(
                    event_id = %event_id,
                    intent_id = %intent.intent_id,
                    "no booking for failed intent, acknowledging"
                );
                return Ok(WebhookOutcome::UnknownIntent);
            };

            if booking.status != BookingStatus::Pending {
                tracing::info!(
                    event_id = %event_id,
                    booking_id = %booking.id,
                    status = booking.status.as_str(),
                    "payment failure for non-pending booking ignored"
                );
                return Ok(WebhookOutcome::Ignored);
            }

            let code = intent.last_error.as_ref().and_then(|e| e.code.as_deref());
            let message = intent.last_error.as_ref().and_then(|e| e.message.as_deref());
            tracing::warn!(
                event_id = %event_id,
                booking_id = %booking.id,
                intent_id = %intent.intent_id,
                failure_code = code.unwrap_or("unknown"),
                failure_message = message.unwrap_or(""),
                "payment failed, booking stays pending"
            );

            // Booking status is deliberately left alone so the patient can retry.
            queries::record_payment_failure(
                conn,
                &PaymentFailure {
                    event_id,
                    booking_id: &booking.id,
                    intent_id: &intent.intent_id,
                    code,
                    message,
                },
                &now,
            )?;

            Ok(WebhookOutcome::FailureRecorded {
                booking_id: booking.id,
            })
        }
        GatewayEvent::Ignored {
            event_id,
            event_type,
        } => {
            tracing::debug!(event_id = %event_id, event_type = %event_type, "ignoring gateway event");
            Ok(WebhookOutcome::Ignored)
        }
    }
}

/// Records the captured payment and confirms the booking, or reports the confirmation that
/// an earlier attempt already made.
pub fn reconcile(
    conn: &mut Connection,
    booking_id: &str,
    intent: &IntentSnapshot,
    now: NaiveDateTime,
) -> Result<Confirmation, AppError> {
    let tx = conn.transaction()?;

    let booking = queries::get_booking(&tx, booking_id)?
        .ok_or_else(|| AppError::BookingNotFound(booking_id.to_string()))?;
    if booking.stripe_payment_intent_id.as_deref() != Some(intent.intent_id.as_str()) {
        return Err(AppError::IntentMismatch);
    }

    if !intent.currency.eq_ignore_ascii_case(&booking.currency) {
        tracing::error!(
            booking_id,
            intent_id = %intent.intent_id,
            expected = %booking.currency,
            captured = %intent.currency,
            "captured currency differs from booking currency"
        );
        return Err(AppError::CurrencyMismatch {
            expected: booking.currency.clone(),
            captured: intent.currency.clone(),
        });
    }

    let expected_minor = money::to_minor_units(booking.grand_total_cost).ok_or_else(|| {
        AppError::Internal(format!("booking total {} out of range", booking.grand_total_cost))
    })?;
    if intent.amount_minor != expected_minor {
        tracing::error!(
            booking_id,
            intent_id = %intent.intent_id,
            expected = %booking.grand_total_cost,
            captured = %money::from_minor_units(intent.amount_minor),
            "captured amount differs from booking total"
        );
        return Err(AppError::AmountMismatch {
            expected_minor,
            captured_minor: intent.amount_minor,
        });
    }

    let payment = Payment {
        id: uuid::Uuid::new_v4().to_string(),
        booking_id: booking.id.clone(),
        payment_method: intent
            .payment_method_type
            .clone()
            .unwrap_or_else(|| "card".to_string()),
        amount: booking.grand_total_cost,
        currency: booking.currency.clone(),
        transaction_ref: intent
            .charge
            .charge_id
            .clone()
            .unwrap_or_else(|| intent.intent_id.clone()),
        stripe_payment_intent_id: intent.intent_id.clone(),
        charge_id: intent.charge.charge_id.clone(),
        card_brand: intent.charge.brand.clone(),
        card_last4: intent.charge.last4.clone(),
        status: PaymentStatus::Succeeded,
        payment_date: now,
    };

    match queries::insert_payment(&tx, &payment) {
        Ok(()) => {}
        Err(e) if errors::is_unique_violation(&e) => {
            drop(tx);
            return match existing_confirmation(conn, booking_id, &intent.intent_id)? {
                Some(existing) => {
                    tracing::info!(
                        booking_id,
                        intent_id = %intent.intent_id,
                        "payment already recorded, treating as success"
                    );
                    Ok(existing)
                }
                // The booking was paid through some other intent.
                None => Err(AppError::InvalidState(booking.status)),
            };
        }
        Err(e) => return Err(e.into()),
    }

    if booking.status != BookingStatus::Pending {
        return Err(AppError::InvalidState(booking.status));
    }
    if booking.is_expired(now) {
        tracing::error!(
            booking_id,
            intent_id = %intent.intent_id,
            "payment captured for an expired draft, needs operator follow-up"
        );
        return Err(AppError::DraftExpired);
    }

    let confirmation_number = generate_confirmation_number(now);
    if !queries::mark_confirmed(&tx, booking_id, &intent.intent_id, &confirmation_number, &now)? {
        return Err(AppError::InvalidState(booking.status));
    }

    let confirmed = queries::get_booking(&tx, booking_id)?
        .ok_or_else(|| AppError::BookingNotFound(booking_id.to_string()))?;
    tx.commit()?;

    tracing::info!(
        booking_id,
        intent_id = %intent.intent_id,
        confirmation_number = %confirmation_number,
        amount = %payment.amount,
        "booking confirmed"
    );

    Ok(Confirmation {
        booking: confirmed,
        payment,
        replayed: false,
    })
}

fn existing_confirmation(
    conn: &Connection,
    booking_id: &str,
    intent_id: &str,
) -> Result<Option<Confirmation>, AppError> {
    let Some(payment) = queries::get_payment_by_intent(conn, intent_id)? else {
        return Ok(None);
    };
    if payment.booking_id != booking_id {
        return Ok(None);
    }
    let booking = queries::get_booking(conn, booking_id)?
        .ok_or_else(|| AppError::BookingNotFound(booking_id.to_string()))?;

    Ok(Some(Confirmation {
        booking,
        payment,
        replayed: true,
    }))
}

fn generate_confirmation_number(now: NaiveDateTime) -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("PHL-{}-{suffix}", now.format("%y%m%d"))
}
