use std::collections::HashSet;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::db::queries;
use crate::errors::AppError;
use crate::models::money;
use crate::models::{Booking, BookingItem, BookingStatus, CollectionType, ServiceAddress};
use crate::services::catalog;

pub const DRAFT_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    #[validate(length(min = 1, max = 64))]
    pub provider_id: String,
    #[validate(
        length(min = 1, max = 20, message = "select between 1 and 20 services"),
        custom(function = "distinct_services")
    )]
    pub service_ids: Vec<String>,
    pub collection_type: CollectionType,
    pub scheduled_date: NaiveDate,
    #[validate(length(min = 1, max = 32))]
    pub time_slot: String,
    #[validate(custom(function = "complete_address"))]
    pub address: ServiceAddress,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[allow(clippy::ptr_arg)]
fn distinct_services(service_ids: &Vec<String>) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    if service_ids.iter().all(|id| !id.trim().is_empty() && seen.insert(id)) {
        Ok(())
    } else {
        Err(ValidationError::new("duplicate_or_blank_service"))
    }
}

fn complete_address(address: &ServiceAddress) -> Result<(), ValidationError> {
    let required = [
        &address.line1,
        &address.city,
        &address.region,
        &address.postal_code,
    ];
    if required.iter().any(|field| field.trim().is_empty()) {
        return Err(ValidationError::new("incomplete_address"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftReceipt {
    pub booking_id: String,
    pub draft_token: String,
    pub expires_at: NaiveDateTime,
    pub total_cost: Decimal,
    pub currency: String,
    pub items: Vec<BookingItem>,
}

/// Builds a pending draft with prices and commission frozen from the catalog as of `now`.
/// Either the booking and every item are written, or nothing is.
pub fn create_draft(
    conn: &mut Connection,
    patient_id: &str,
    request: &DraftRequest,
    currency: &str,
    now: NaiveDateTime,
) -> Result<DraftReceipt, AppError> {
    request.validate()?;
    if patient_id.trim().is_empty() {
        return Err(AppError::Validation("missing patient identity".to_string()));
    }
    if request.scheduled_date < now.date() {
        return Err(AppError::Validation(
            "scheduled date is in the past".to_string(),
        ));
    }

    let tx = conn.transaction()?;

    let offerings = catalog::snapshot(&tx, &request.provider_id, &request.service_ids, now.date())?;
    if offerings.len() != request.service_ids.len() {
        tracing::info!(
            provider_id = %request.provider_id,
            requested = request.service_ids.len(),
            matched = offerings.len(),
            "draft rejected, services unavailable"
        );
        return Err(AppError::ServiceUnavailable {
            requested: request.service_ids.len(),
            matched: offerings.len(),
        });
    }

    let booking_id = uuid::Uuid::new_v4().to_string();
    let draft_token = generate_draft_token();
    let expires_at = now + Duration::minutes(DRAFT_TTL_MINUTES);

    let items: Vec<BookingItem> = offerings
        .iter()
        .map(|offering| BookingItem {
            id: uuid::Uuid::new_v4().to_string(),
            booking_id: booking_id.clone(),
            provider_service_id: offering.id.clone(),
            service_id: offering.service_id.clone(),
            item_cost: money::normalize(offering.cost),
            agreed_comm_percent: offering.commission_percent,
            created_at: now,
        })
        .collect();
    let total = money::normalize(items.iter().map(|item| item.item_cost).sum());

    let booking = Booking {
        id: booking_id.clone(),
        patient_id: patient_id.to_string(),
        provider_id: request.provider_id.clone(),
        status: BookingStatus::Pending,
        collection_type: request.collection_type,
        scheduled_date: request.scheduled_date,
        time_slot: request.time_slot.clone(),
        service_address: request.address.clone(),
        notes: request.notes.clone(),
        grand_total_cost: total,
        discount_amount: money::normalize(Decimal::ZERO),
        promo_code: None,
        currency: currency.to_string(),
        stripe_payment_intent_id: None,
        confirmation_number: None,
        draft_token: Some(draft_token.clone()),
        draft_expires_at: Some(expires_at),
        confirmed_at: None,
        cancelled_at: None,
        cancellation_reason: None,
        created_at: now,
        updated_at: now,
    };

    queries::insert_booking(&tx, &booking)?;
    for item in &items {
        queries::insert_booking_item(&tx, item)?;
    }
    tx.commit()?;

    tracing::info!(
        booking_id = %booking_id,
        patient_id,
        provider_id = %request.provider_id,
        total = %total,
        items = items.len(),
        "draft created"
    );

    Ok(DraftReceipt {
        booking_id,
        draft_token,
        expires_at,
        total_cost: total,
        currency: currency.to_string(),
        items,
    })
}

fn generate_draft_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
