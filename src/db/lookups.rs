//! Status and type lookup rows are resolved once at startup instead of per request.

use rusqlite::{params, Connection};

use crate::errors::AppError;
use crate::models::{BookingStatus, CollectionType, PaymentStatus};

pub fn verify(conn: &Connection) -> Result<(), AppError> {
    let required = BookingStatus::ALL
        .iter()
        .map(|s| ("booking_statuses", s.as_str()))
        .chain(PaymentStatus::ALL.iter().map(|s| ("payment_statuses", s.as_str())))
        .chain(CollectionType::ALL.iter().map(|c| ("collection_types", c.as_str())));

    for (table, code) in required {
        let present: bool = conn.query_row(
            &format!("SELECT COUNT(*) > 0 FROM {table} WHERE code = ?1"),
            params![code],
            |row| row.get(0),
        )?;

        if !present {
            tracing::error!(table, code, "required lookup row is missing");
            return Err(AppError::MissingLookupData(format!("{table}.{code}")));
        }
    }

    Ok(())
}
