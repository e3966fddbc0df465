//! Fee schedules — maker/taker basis points on the quote leg.
//!
//! Fees are charged in the quote symbol and rounded up to the quote
//! precision, so sub-precision remainders always favor the exchange.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use barflow_core::round_fee_up;

/// Whether a fill rested on the book before the bar (maker) or crossed
/// within it (taker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillRole {
    Maker,
    Taker,
}

/// Computes the quote-denominated fee for a fill.
pub trait FeeSchedule: Send + Sync {
    /// Fee rate as a fraction (not bps) for the given role.
    fn rate(&self, role: FillRole) -> Decimal;

    /// Fee on a quote amount, rounded up to `quote_precision`.
    fn fee(&self, quote_amount: Decimal, role: FillRole, quote_precision: u32) -> Decimal {
        round_fee_up(quote_amount * self.rate(role), quote_precision)
    }
}

/// Flat maker/taker percentage schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentageFees {
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

impl PercentageFees {
    pub fn new(maker_rate: Decimal, taker_rate: Decimal) -> Self {
        Self { maker_rate, taker_rate }
    }

    pub fn from_bps(maker_bps: Decimal, taker_bps: Decimal) -> Self {
        let scale = Decimal::from(10_000);
        Self { maker_rate: maker_bps / scale, taker_rate: taker_bps / scale }
    }
}

impl FeeSchedule for PercentageFees {
    fn rate(&self, role: FillRole) -> Decimal {
        match role {
            FillRole::Maker => self.maker_rate,
            FillRole::Taker => self.taker_rate,
        }
    }
}

/// Frictionless schedule for tests and calibration runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFees;

impl FeeSchedule for NoFees {
    fn rate(&self, _role: FillRole) -> Decimal {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bps_convert_to_rates() {
        let fees = PercentageFees::from_bps(dec!(10), dec!(25));
        assert_eq!(fees.rate(FillRole::Maker), dec!(0.001));
        assert_eq!(fees.rate(FillRole::Taker), dec!(0.0025));
    }

    #[test]
    fn fee_rounds_up_to_quote_precision() {
        let fees = PercentageFees::from_bps(dec!(10), dec!(10));
        // 100.05 * 0.001 = 0.10005 -> rounds up to 0.11 at 2 dp.
        assert_eq!(fees.fee(dec!(100.05), FillRole::Taker, 2), dec!(0.11));
        // Exact results are untouched.
        assert_eq!(fees.fee(dec!(100), FillRole::Taker, 2), dec!(0.10));
    }

    #[test]
    fn no_fees_is_zero() {
        assert_eq!(NoFees.fee(dec!(12345.67), FillRole::Taker, 2), Decimal::ZERO);
    }
}
