use rusqlite::Connection;
use serde::Serialize;

use crate::db::queries;
use crate::errors::AppError;
use crate::models::{Booking, BookingItem, Payment};

#[derive(Debug, Clone, Serialize)]
pub struct BookingView {
    pub booking: Booking,
    pub items: Vec<BookingItem>,
    pub payment: Option<Payment>,
}

/// Owner-only read. A draft is visible only with its token; anyone else gets not-found so
/// draft ids cannot be guessed.
pub fn load(
    conn: &Connection,
    patient_id: &str,
    booking_id: &str,
    draft_token: Option<&str>,
) -> Result<BookingView, AppError> {
    let booking = queries::get_booking(conn, booking_id)?
        .filter(|b| b.patient_id == patient_id)
        .filter(|b| match b.draft_token.as_deref() {
            Some(token) => draft_token == Some(token),
            None => true,
        })
        .ok_or_else(|| AppError::BookingNotFound(booking_id.to_string()))?;

    let items = queries::get_booking_items(conn, booking_id)?;
    let payment = queries::get_payment_for_booking(conn, booking_id)?;

    Ok(BookingView {
        booking,
        items,
        payment,
    })
}
