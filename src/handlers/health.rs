use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let db_ok = state
        .db()
        .ok()
        .and_then(|db| db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).ok())
        .is_some();

    if db_ok {
        Json(serde_json::json!({"status": "ok"})).into_response()
    } else {
        tracing::error!("health check failed, database unavailable");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable"})),
        )
            .into_response()
    }
}
