use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::models::money;
use crate::models::{
    Booking, BookingItem, BookingStatus, CollectionType, Offering, Payment, PaymentStatus,
    ServiceAddress,
};

pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_ts(ts: &NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

// ── Catalog ──

pub fn provider_exists(conn: &Connection, provider_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM providers WHERE id = ?1",
        params![provider_id],
        |row| row.get(0),
    )
}

/// Offerings of `provider_id` for `service_ids` that are active on `on_date`.
pub fn active_offerings(
    conn: &Connection,
    provider_id: &str,
    service_ids: &[String],
    on_date: NaiveDate,
) -> rusqlite::Result<Vec<Offering>> {
    if service_ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders = (0..service_ids.len())
        .map(|i| format!("?{}", i + 3))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT id, provider_id, service_id, name, cost, commission_percent
         FROM provider_services
         WHERE provider_id = ?1
           AND status = 'active'
           AND start_date <= ?2
           AND (end_date IS NULL OR end_date >= ?2)
           AND service_id IN ({placeholders})
         ORDER BY service_id ASC, start_date DESC"
    );

    let day = on_date.format(DATE_FORMAT).to_string();
    let bind = [provider_id.to_string(), day]
        .into_iter()
        .chain(service_ids.iter().cloned());

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(bind), |row| {
        Ok(Offering {
            id: row.get(0)?,
            provider_id: row.get(1)?,
            service_id: row.get(2)?,
            name: row.get(3)?,
            cost: decimal_col(row, 4)?,
            commission_percent: decimal_col(row, 5)?,
        })
    })?;

    let mut offerings: Vec<Offering> = vec![];
    for row in rows {
        let offering = row?;
        // Overlapping windows: the most recently started entry wins.
        if offerings.last().map(|o| o.service_id.as_str()) != Some(offering.service_id.as_str()) {
            offerings.push(offering);
        }
    }
    Ok(offerings)
}

// ── Bookings ──

const BOOKING_COLUMNS: &str = "id, patient_id, provider_id, status, collection_type, scheduled_date, \
     time_slot, service_address, notes, grand_total_cost, discount_amount, promo_code, currency, \
     stripe_payment_intent_id, confirmation_number, draft_token, draft_expires_at, confirmed_at, \
     cancelled_at, cancellation_reason, created_at, updated_at";

pub fn insert_booking(conn: &Connection, booking: &Booking) -> rusqlite::Result<()> {
    let address = serde_json::to_string(&booking.service_address)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    conn.execute(
        &format!(
            "INSERT INTO bookings ({BOOKING_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
        ),
        params![
            booking.id,
            booking.patient_id,
            booking.provider_id,
            booking.status.as_str(),
            booking.collection_type.as_str(),
            booking.scheduled_date.format(DATE_FORMAT).to_string(),
            booking.time_slot,
            address,
            booking.notes,
            money::to_db(booking.grand_total_cost),
            money::to_db(booking.discount_amount),
            booking.promo_code,
            booking.currency,
            booking.stripe_payment_intent_id,
            booking.confirmation_number,
            booking.draft_token,
            booking.draft_expires_at.as_ref().map(format_ts),
            booking.confirmed_at.as_ref().map(format_ts),
            booking.cancelled_at.as_ref().map(format_ts),
            booking.cancellation_reason,
            format_ts(&booking.created_at),
            format_ts(&booking.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_booking(conn: &Connection, id: &str) -> rusqlite::Result<Option<Booking>> {
    conn.query_row(
        &format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?1"),
        params![id],
        parse_booking_row,
    )
    .optional()
}

pub fn get_booking_by_intent(
    conn: &Connection,
    intent_id: &str,
) -> rusqlite::Result<Option<Booking>> {
    conn.query_row(
        &format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE stripe_payment_intent_id = ?1"),
        params![intent_id],
        parse_booking_row,
    )
    .optional()
}

/// Stores the intent on a still-pending draft. Returns false if the draft changed underneath.
pub fn attach_payment_intent(
    conn: &Connection,
    booking_id: &str,
    draft_token: &str,
    intent_id: &str,
    now: &NaiveDateTime,
) -> rusqlite::Result<bool> {
    let count = conn.execute(
        "UPDATE bookings SET stripe_payment_intent_id = ?1, updated_at = ?2
         WHERE id = ?3 AND draft_token = ?4 AND status = 'pending'",
        params![intent_id, format_ts(now), booking_id, draft_token],
    )?;
    Ok(count > 0)
}

/// `Pending -> Confirmed`. Assigns the confirmation number and clears the draft fields in
/// the same statement.
pub fn mark_confirmed(
    conn: &Connection,
    booking_id: &str,
    intent_id: &str,
    confirmation_number: &str,
    now: &NaiveDateTime,
) -> rusqlite::Result<bool> {
    let now = format_ts(now);
    let count = conn.execute(
        "UPDATE bookings
         SET status = 'confirmed',
             confirmation_number = ?1,
             draft_token = NULL,
             draft_expires_at = NULL,
             confirmed_at = ?2,
             updated_at = ?2
         WHERE id = ?3
           AND status = 'pending'
           AND stripe_payment_intent_id = ?4
           AND confirmation_number IS NULL",
        params![confirmation_number, now, booking_id, intent_id],
    )?;
    Ok(count > 0)
}

fn parse_booking_row(row: &Row) -> rusqlite::Result<Booking> {
    let status: String = row.get(3)?;
    let collection_type: String = row.get(4)?;
    let scheduled_date: String = row.get(5)?;
    let address: String = row.get(7)?;

    Ok(Booking {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        provider_id: row.get(2)?,
        status: BookingStatus::parse(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown booking status {status}")))?,
        collection_type: CollectionType::parse(&collection_type).ok_or_else(|| {
            conversion_error(4, format!("unknown collection type {collection_type}"))
        })?,
        scheduled_date: NaiveDate::parse_from_str(&scheduled_date, DATE_FORMAT)
            .map_err(|e| conversion_error(5, e))?,
        time_slot: row.get(6)?,
        service_address: serde_json::from_str::<ServiceAddress>(&address)
            .map_err(|e| conversion_error(7, e))?,
        notes: row.get(8)?,
        grand_total_cost: decimal_col(row, 9)?,
        discount_amount: decimal_col(row, 10)?,
        promo_code: row.get(11)?,
        currency: row.get(12)?,
        stripe_payment_intent_id: row.get(13)?,
        confirmation_number: row.get(14)?,
        draft_token: row.get(15)?,
        draft_expires_at: optional_ts_col(row, 16)?,
        confirmed_at: optional_ts_col(row, 17)?,
        cancelled_at: optional_ts_col(row, 18)?,
        cancellation_reason: row.get(19)?,
        created_at: ts_col(row, 20)?,
        updated_at: ts_col(row, 21)?,
    })
}

// ── Booking Items ──

pub fn insert_booking_item(conn: &Connection, item: &BookingItem) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO booking_items (id, booking_id, provider_service_id, service_id, item_cost, agreed_comm_percent, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item.id,
            item.booking_id,
            item.provider_service_id,
            item.service_id,
            money::to_db(item.item_cost),
            item.agreed_comm_percent.to_string(),
            format_ts(&item.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_booking_items(conn: &Connection, booking_id: &str) -> rusqlite::Result<Vec<BookingItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, booking_id, provider_service_id, service_id, item_cost, agreed_comm_percent, created_at
         FROM booking_items WHERE booking_id = ?1 ORDER BY service_id ASC",
    )?;

    let rows = stmt.query_map(params![booking_id], |row| {
        Ok(BookingItem {
            id: row.get(0)?,
            booking_id: row.get(1)?,
            provider_service_id: row.get(2)?,
            service_id: row.get(3)?,
            item_cost: decimal_col(row, 4)?,
            agreed_comm_percent: decimal_col(row, 5)?,
            created_at: ts_col(row, 6)?,
        })
    })?;

    let items = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

// ── Payments ──

const PAYMENT_COLUMNS: &str = "id, booking_id, payment_method, amount, currency, transaction_ref, \
     stripe_payment_intent_id, charge_id, card_brand, card_last4, status, payment_date";

/// Fails with a unique-constraint violation when the intent (or booking) already has a payment.
pub fn insert_payment(conn: &Connection, payment: &Payment) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            payment.id,
            payment.booking_id,
            payment.payment_method,
            money::to_db(payment.amount),
            payment.currency,
            payment.transaction_ref,
            payment.stripe_payment_intent_id,
            payment.charge_id,
            payment.card_brand,
            payment.card_last4,
            payment.status.as_str(),
            format_ts(&payment.payment_date),
        ],
    )?;
    Ok(())
}

pub fn get_payment_by_intent(
    conn: &Connection,
    intent_id: &str,
) -> rusqlite::Result<Option<Payment>> {
    conn.query_row(
        &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE stripe_payment_intent_id = ?1"),
        params![intent_id],
        parse_payment_row,
    )
    .optional()
}

pub fn get_payment_for_booking(
    conn: &Connection,
    booking_id: &str,
) -> rusqlite::Result<Option<Payment>> {
    conn.query_row(
        &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE booking_id = ?1"),
        params![booking_id],
        parse_payment_row,
    )
    .optional()
}

fn parse_payment_row(row: &Row) -> rusqlite::Result<Payment> {
    let status: String = row.get(10)?;

    Ok(Payment {
        id: row.get(0)?,
        booking_id: row.get(1)?,
        payment_method: row.get(2)?,
        amount: decimal_col(row, 3)?,
        currency: row.get(4)?,
        transaction_ref: row.get(5)?,
        stripe_payment_intent_id: row.get(6)?,
        charge_id: row.get(7)?,
        card_brand: row.get(8)?,
        card_last4: row.get(9)?,
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| conversion_error(10, format!("unknown payment status {status}")))?,
        payment_date: ts_col(row, 11)?,
    })
}

// ── Payment Failures ──

pub struct PaymentFailure<'a> {
    pub event_id: &'a str,
    pub booking_id: &'a str,
    pub intent_id: &'a str,
    pub code: Option<&'a str>,
    pub message: Option<&'a str>,
}

/// Returns false when the event was already recorded.
pub fn record_payment_failure(
    conn: &Connection,
    failure: &PaymentFailure<'_>,
    now: &NaiveDateTime,
) -> rusqlite::Result<bool> {
    let count = conn.execute(
        "INSERT OR IGNORE INTO payment_failures (event_id, booking_id, stripe_payment_intent_id, failure_code, failure_message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            failure.event_id,
            failure.booking_id,
            failure.intent_id,
            failure.code,
            failure.message,
            format_ts(now),
        ],
    )?;
    Ok(count > 0)
}

// ── Column helpers ──

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn decimal_col(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, TS_FORMAT).map_err(|e| conversion_error(idx, e))
}

fn optional_ts_col(row: &Row, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| NaiveDateTime::parse_from_str(&s, TS_FORMAT).map_err(|e| conversion_error(idx, e)))
        .transpose()
}
