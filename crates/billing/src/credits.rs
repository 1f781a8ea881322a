//! Money-to-credits conversion
//!
//! Conversion is fixed-rate integer arithmetic: 0.05 credits per minor
//! currency unit, rounded half-up. Done in integers end to end so a payment
//! amount always maps to the same credit grant regardless of platform
//! float behavior.

use crate::error::BillingError;

/// Conversion rate numerator: credits per minor unit = NUM / DEN.
pub const CREDITS_PER_MINOR_UNIT_NUM: i64 = 5;
/// Conversion rate denominator.
pub const CREDITS_PER_MINOR_UNIT_DEN: i64 = 100;

/// Default credit grant for a newly activated free subscription.
pub const WELCOME_CREDITS: i64 = 100;

/// Convert a payment amount in minor currency units to whole credits,
/// rounding half-up. 1000 minor units yields 50 credits.
pub fn credits_for_amount(amount_minor: i64) -> Result<i64, BillingError> {
    if amount_minor < 0 {
        return Err(BillingError::InvalidAmount(amount_minor));
    }
    // Half-up: add half the denominator before dividing.
    Ok((amount_minor * CREDITS_PER_MINOR_UNIT_NUM + CREDITS_PER_MINOR_UNIT_DEN / 2)
        / CREDITS_PER_MINOR_UNIT_DEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_amounts() {
        assert_eq!(credits_for_amount(1000).unwrap(), 50);
        assert_eq!(credits_for_amount(0).unwrap(), 0);
        assert_eq!(credits_for_amount(100).unwrap(), 5);
        // CHF 129.00 yearly -> 645 credits
        assert_eq!(credits_for_amount(12900).unwrap(), 645);
    }

    #[test]
    fn test_rounding_half_up() {
        // 9 minor units = 0.45 credits, rounds to 0
        assert_eq!(credits_for_amount(9).unwrap(), 0);
        // 10 minor units = 0.50 credits, rounds up to 1
        assert_eq!(credits_for_amount(10).unwrap(), 1);
        // 11 minor units = 0.55 credits, rounds to 1
        assert_eq!(credits_for_amount(11).unwrap(), 1);
        // 30 minor units = 1.50 credits, rounds up to 2
        assert_eq!(credits_for_amount(30).unwrap(), 2);
    }

    #[test]
    fn test_monotonic_over_small_range() {
        let mut prev = 0;
        for amount in 0..5000 {
            let c = credits_for_amount(amount).unwrap();
            assert!(c >= prev, "credits decreased at amount {amount}");
            prev = c;
        }
    }

    #[test]
    fn test_negative_amount_rejected() {
        assert!(matches!(
            credits_for_amount(-1),
            Err(BillingError::InvalidAmount(-1))
        ));
    }
}
