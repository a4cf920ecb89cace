use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::models::BookingStatus;

/// Coarse failure classes. Handlers and the webhook endpoint decide retry behavior from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ExternalService,
    Configuration,
    Signature,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("booking not found: {0}")]
    BookingNotFound(String),

    #[error("{matched} of {requested} requested services are currently offered")]
    ServiceUnavailable { requested: usize, matched: usize },

    #[error("booking draft has expired")]
    DraftExpired,

    #[error("payment intent does not match booking")]
    IntentMismatch,

    #[error("booking is {} and cannot be changed this way", .0.as_str())]
    InvalidState(BookingStatus),

    #[error("captured amount {captured_minor} does not match booking total {expected_minor}")]
    AmountMismatch { expected_minor: i64, captured_minor: i64 },

    #[error("captured currency {captured} does not match booking currency {expected}")]
    CurrencyMismatch { expected: String, captured: String },

    #[error("payment intent {0} is already being processed")]
    PaymentInProgress(String),

    #[error("payment has not succeeded (gateway status: {0})")]
    PaymentNotSucceeded(String),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("payment gateway timed out")]
    GatewayTimeout,

    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("missing lookup data: {0}")]
    MissingLookupData(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::ProviderNotFound(_) | AppError::BookingNotFound(_) => ErrorKind::NotFound,
            AppError::ServiceUnavailable { .. }
            | AppError::DraftExpired
            | AppError::IntentMismatch
            | AppError::InvalidState(_)
            | AppError::AmountMismatch { .. }
            | AppError::CurrencyMismatch { .. }
            | AppError::PaymentInProgress(_)
            | AppError::PaymentNotSucceeded(_) => ErrorKind::Conflict,
            AppError::Gateway(_) | AppError::GatewayTimeout => ErrorKind::ExternalService,
            AppError::MissingLookupData(_) | AppError::Config(_) => ErrorKind::Configuration,
            AppError::InvalidSignature(_) => ErrorKind::Signature,
            AppError::Database(_) | AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::ProviderNotFound(_) => "provider_not_found",
            AppError::BookingNotFound(_) => "booking_not_found",
            AppError::ServiceUnavailable { .. } => "service_unavailable",
            AppError::DraftExpired => "draft_expired",
            AppError::IntentMismatch => "intent_mismatch",
            AppError::InvalidState(_) => "invalid_state",
            AppError::AmountMismatch { .. } => "amount_mismatch",
            AppError::CurrencyMismatch { .. } => "currency_mismatch",
            AppError::PaymentInProgress(_) => "payment_in_progress",
            AppError::PaymentNotSucceeded(_) => "payment_not_succeeded",
            AppError::Gateway(_) => "gateway_error",
            AppError::GatewayTimeout => "gateway_timeout",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::MissingLookupData(_) | AppError::Config(_) => "configuration_error",
            AppError::Database(_) | AppError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show a patient. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::ProviderNotFound(_) => "The selected provider could not be found.".into(),
            AppError::BookingNotFound(_) => "Booking not found.".into(),
            AppError::ServiceUnavailable { .. } => {
                "Some of the selected services are no longer available. Please adjust your selection."
                    .into()
            }
            AppError::DraftExpired => {
                "Your booking session has expired. Please start a new booking.".into()
            }
            AppError::IntentMismatch => "This payment does not belong to this booking.".into(),
            AppError::InvalidState(_) => "This booking can no longer be changed.".into(),
            AppError::AmountMismatch { .. } | AppError::CurrencyMismatch { .. } => {
                "The payment amount does not match the booking total.".into()
            }
            AppError::PaymentInProgress(_) => {
                "A payment for this booking is already being processed.".into()
            }
            AppError::PaymentNotSucceeded(_) => {
                "Your payment has not completed. Your booking is saved, please try paying again."
                    .into()
            }
            AppError::Gateway(_) | AppError::GatewayTimeout => {
                "The payment service is temporarily unavailable. Please try again.".into()
            }
            AppError::InvalidSignature(_) => "Invalid signature.".into(),
            AppError::MissingLookupData(_)
            | AppError::Config(_)
            | AppError::Database(_)
            | AppError::Internal(_) => "Something went wrong. Please try again later.".into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => match self.kind() {
                ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::ExternalService => StatusCode::BAD_GATEWAY,
                ErrorKind::Signature => StatusCode::BAD_REQUEST,
                ErrorKind::Configuration | ErrorKind::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    /// Whether the unique-constraint anchor rejected an insert.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, AppError::Database(e) if is_unique_violation(e))
    }
}

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match self.kind() {
            ErrorKind::Configuration => tracing::error!(error = %self, "configuration defect"),
            ErrorKind::Internal => tracing::error!(error = %self, "request failed"),
            ErrorKind::ExternalService => tracing::warn!(error = %self, "gateway failure"),
            _ => tracing::info!(error = %self, code = self.code(), "request rejected"),
        }

        let body = serde_json::json!({
            "error": self.code(),
            "message": self.user_message(),
        });
        (status, axum::Json(body)).into_response()
    }
}
