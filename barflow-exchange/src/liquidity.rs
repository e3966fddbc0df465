//! Liquidity models — per-bar fillable volume and fill pricing.
//!
//! A model answers two questions for a bar: how much volume can be taken
//! from it in total, and at what price the next fill executes given how
//! much of that bucket earlier fills already consumed.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use barflow_core::Bar;

use crate::order::OrderSide;

/// Bounds per-bar fills and derives the representative fill price.
pub trait LiquidityModel: Send + Sync {
    /// Total volume fillable within this bar, across all orders.
    fn available_volume(&self, bar: &Bar) -> Decimal;

    /// Price for the next fill. `consumed` is the volume already taken from
    /// this bar's bucket, so the first fill of a bar pays no impact.
    fn representative_price(
        &self,
        bar: &Bar,
        side: OrderSide,
        consumed: Decimal,
        available: Decimal,
    ) -> Decimal;
}

/// Default model: a fraction of the bar's volume is fillable, and price
/// worsens linearly with the share of that bucket already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeShareLiquidity {
    /// Fraction of bar volume available to fills (0 to 1).
    pub volume_limit: Decimal,
    /// Price impact at full bucket consumption, as a fraction of the open.
    pub price_impact: Decimal,
}

impl VolumeShareLiquidity {
    pub fn new(volume_limit: Decimal, price_impact: Decimal) -> Self {
        debug_assert!(
            volume_limit >= Decimal::ZERO && volume_limit <= Decimal::ONE,
            "volume limit must be a fraction"
        );
        Self { volume_limit, price_impact }
    }
}

impl Default for VolumeShareLiquidity {
    fn default() -> Self {
        // 25% of bar volume, 10% worst-case impact.
        Self {
            volume_limit: Decimal::new(25, 2),
            price_impact: Decimal::new(10, 2),
        }
    }
}

impl LiquidityModel for VolumeShareLiquidity {
    fn available_volume(&self, bar: &Bar) -> Decimal {
        bar.volume * self.volume_limit
    }

    fn representative_price(
        &self,
        bar: &Bar,
        side: OrderSide,
        consumed: Decimal,
        available: Decimal,
    ) -> Decimal {
        if available.is_zero() || self.price_impact.is_zero() {
            return bar.open;
        }
        let share = (consumed / available).min(Decimal::ONE);
        let charge = bar.open * self.price_impact * share;
        match side {
            OrderSide::Buy => bar.open + charge,
            OrderSide::Sell => bar.open - charge,
        }
    }
}

/// No volume cap and no impact; every fill executes at the open.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedLiquidity;

impl LiquidityModel for UnlimitedLiquidity {
    fn available_volume(&self, _bar: &Bar) -> Decimal {
        Decimal::MAX
    }

    fn representative_price(
        &self,
        bar: &Bar,
        _side: OrderSide,
        _consumed: Decimal,
        _available: Decimal,
    ) -> Decimal {
        bar.open
    }
}
