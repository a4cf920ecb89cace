use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub patient_id: String,
    pub provider_id: String,
    pub status: BookingStatus,
    pub collection_type: CollectionType,
    pub scheduled_date: NaiveDate,
    pub time_slot: String,
    pub service_address: ServiceAddress,
    pub notes: Option<String>,
    pub grand_total_cost: Decimal,
    pub discount_amount: Decimal,
    pub promo_code: Option<String>,
    pub currency: String,
    pub stripe_payment_intent_id: Option<String>,
    pub confirmation_number: Option<String>,
    #[serde(skip_serializing)]
    pub draft_token: Option<String>,
    pub draft_expires_at: Option<NaiveDateTime>,
    pub confirmed_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancellation_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Booking {
    /// A pending booking still carrying its draft token.
    pub fn is_draft(&self) -> bool {
        self.status == BookingStatus::Pending && self.draft_token.is_some()
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.status == BookingStatus::Pending
            && self.draft_expires_at.is_some_and(|expires| expires <= now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 4] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    HomeVisit,
    WalkIn,
}

impl CollectionType {
    pub const ALL: [CollectionType; 2] = [CollectionType::HomeVisit, CollectionType::WalkIn];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::HomeVisit => "home_visit",
            CollectionType::WalkIn => "walk_in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

/// Address as entered at booking time. Later profile edits do not touch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAddress {
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub region: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingItem {
    pub id: String,
    pub booking_id: String,
    pub provider_service_id: String,
    pub service_id: String,
    pub item_cost: Decimal,
    pub agreed_comm_percent: Decimal,
    pub created_at: NaiveDateTime,
}
