//! Trading pairs, per-pair precision, and the decimal rounding rules.
//!
//! Every money amount in the system is a [`Decimal`]. Quantities truncate
//! toward zero to the base precision, prices round half-up to the quote
//! precision, and fees round up so rounding never favors the account.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A traded pair: base asset priced in the quote asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self { base: base.into(), quote: quote.into() }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Precision metadata for a pair: decimal places for base quantities and
/// quote prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairInfo {
    pub base_precision: u32,
    pub quote_precision: u32,
}

impl PairInfo {
    pub fn new(base_precision: u32, quote_precision: u32) -> Self {
        Self { base_precision, quote_precision }
    }

    /// Truncate a base quantity to this pair's base precision.
    pub fn truncate_amount(&self, amount: Decimal) -> Decimal {
        truncate_amount(amount, self.base_precision)
    }

    /// Round a quote price to this pair's quote precision, half-up.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_price(price, self.quote_precision)
    }

    /// Round a fee up to this pair's quote precision.
    pub fn round_fee(&self, fee: Decimal) -> Decimal {
        round_fee_up(fee, self.quote_precision)
    }
}

/// Truncate toward zero to `precision` decimal places.
pub fn truncate_amount(amount: Decimal, precision: u32) -> Decimal {
    amount.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}

/// Round half-up to `precision` decimal places.
pub fn round_price(price: Decimal, precision: u32) -> Decimal {
    price.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
}

/// Round up (away from zero) to `precision` decimal places. Fees use this
/// so that any sub-precision remainder is charged, not forgiven.
pub fn round_fee_up(fee: Decimal, precision: u32) -> Decimal {
    fee.round_dp_with_strategy(precision, RoundingStrategy::AwayFromZero)
}
