//! Money is a 2-decimal `Decimal` everywhere inside the service and an integer count of
//! minor units only at the gateway boundary.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

pub const SCALE: u32 = 2;

/// Normalizes to exactly two decimal places.
pub fn normalize(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(SCALE);
    rounded
}

pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (normalize(amount) * Decimal::ONE_HUNDRED).to_i64()
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, SCALE)
}

/// Canonical text form used for storage ("80.00").
pub fn to_db(amount: Decimal) -> String {
    normalize(amount).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minor_units_conversion() {
        assert_eq!(to_minor_units(dec!(80.00)), Some(8000));
        assert_eq!(to_minor_units(dec!(35.5)), Some(3550));
        assert_eq!(from_minor_units(8000), dec!(80.00));
    }

    #[test]
    fn test_storage_form_has_two_places() {
        assert_eq!(to_db(dec!(80)), "80.00");
        assert_eq!(to_db(dec!(12.345)), "12.35");
    }
}
