use chrono::NaiveDate;
use rusqlite::Connection;

use crate::db::queries;
use crate::errors::AppError;
use crate::models::Offering;

/// Resolves the provider's currently offered, priced entries for `service_ids`.
/// Services the provider does not offer on `on_date` are simply absent from the result.
pub fn snapshot(
    conn: &Connection,
    provider_id: &str,
    service_ids: &[String],
    on_date: NaiveDate,
) -> Result<Vec<Offering>, AppError> {
    if !queries::provider_exists(conn, provider_id)? {
        return Err(AppError::ProviderNotFound(provider_id.to_string()));
    }

    Ok(queries::active_offerings(conn, provider_id, service_ids, on_date)?)
}
