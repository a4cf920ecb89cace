use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A provider's currently active, priced entry for one catalog service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offering {
    pub id: String,
    pub provider_id: String,
    pub service_id: String,
    pub name: String,
    pub cost: Decimal,
    pub commission_percent: Decimal,
}
