//! Orders — types, lifecycle, and fill bookkeeping.
//!
//! The state machine is `New → Open → (PartiallyFilled)* → Filled |
//! Canceled | Rejected`, with stop-limits passing through `PendingTrigger`
//! before `Open`. Terminal states are absorbing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use barflow_core::Pair;

/// Identifier assigned by the order manager at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { limit: Decimal },
    StopLimit { stop: Decimal, limit: Decimal },
}

impl OrderType {
    pub fn limit_price(&self) -> Option<Decimal> {
        match self {
            OrderType::Market => None,
            OrderType::Limit { limit } | OrderType::StopLimit { limit, .. } => Some(*limit),
        }
    }

    pub fn stop_price(&self) -> Option<Decimal> {
        match self {
            OrderType::StopLimit { stop, .. } => Some(*stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    New,
    /// Stop-limit waiting for its stop condition.
    PendingTrigger,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled | OrderState::Rejected)
    }
}

/// Funds reserved against a live order; released on cancel, consumed on
/// fill.
#[derive(Debug, Clone)]
pub(crate) struct Hold {
    pub symbol: String,
    pub remaining: Decimal,
}

/// A single order owned by the order manager.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub pair: Pair,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub state: OrderState,
    pub filled: Decimal,
    /// Gross quote exchanged so far: cost for buys, proceeds for sells.
    pub quote_spent: Decimal,
    /// Fees accrued, per symbol.
    pub fees: BTreeMap<String, Decimal>,
    pub created_at: DateTime<Utc>,
    /// FIFO tie-break within a matching pass.
    pub(crate) seq: u64,
    pub(crate) hold: Option<Hold>,
    /// Whether the order sat on the book before the bar being matched;
    /// decides maker vs taker fees.
    pub(crate) resting: bool,
    /// Stop condition observed during the current matching pass.
    pub(crate) triggered_this_bar: bool,
}

impl Order {
    pub(crate) fn new(
        id: OrderId,
        seq: u64,
        pair: Pair,
        side: OrderSide,
        order_type: OrderType,
        amount: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        let state = match order_type {
            OrderType::StopLimit { .. } => OrderState::PendingTrigger,
            _ => OrderState::New,
        };
        Self {
            id,
            pair,
            side,
            order_type,
            amount,
            state,
            filled: Decimal::ZERO,
            quote_spent: Decimal::ZERO,
            fees: BTreeMap::new(),
            created_at,
            seq,
            hold: None,
            resting: false,
            triggered_this_bar: false,
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.amount - self.filled
    }

    /// Average fill price, if anything filled. Unrounded.
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        if self.filled.is_zero() {
            None
        } else {
            Some(self.quote_spent / self.filled)
        }
    }

    /// Whether the matcher should consider this order against a bar.
    pub fn is_open(&self) -> bool {
        matches!(self.state, OrderState::Open | OrderState::PartiallyFilled)
    }

    pub(crate) fn accept(&mut self) {
        if self.state == OrderState::New {
            self.state = OrderState::Open;
        }
    }

    pub(crate) fn trigger(&mut self) {
        debug_assert_eq!(self.state, OrderState::PendingTrigger);
        self.state = OrderState::Open;
        self.triggered_this_bar = true;
    }

    pub(crate) fn record_fill(
        &mut self,
        amount: Decimal,
        quote_amount: Decimal,
        fee_symbol: &str,
        fee: Decimal,
    ) {
        debug_assert!(amount <= self.remaining());
        self.filled += amount;
        self.quote_spent += quote_amount;
        if !fee.is_zero() {
            *self.fees.entry(fee_symbol.to_string()).or_insert(Decimal::ZERO) += fee;
        }
        self.state = if self.remaining().is_zero() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
    }
}

/// An executed fill. Immutable; appended to the trade log as matching
/// proceeds.
#[derive(Debug, Clone)]
pub struct Trade {
    pub order_id: OrderId,
    pub pair: Pair,
    pub side: OrderSide,
    pub amount: Decimal,
    pub price: Decimal,
    pub fees: BTreeMap<String, Decimal>,
    pub when: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn order(order_type: OrderType) -> Order {
        Order::new(
            OrderId(1),
            0,
            Pair::new("BTC", "USDT"),
            OrderSide::Buy,
            order_type,
            dec!(2),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn market_orders_start_new_then_open() {
        let mut o = order(OrderType::Market);
        assert_eq!(o.state, OrderState::New);
        o.accept();
        assert_eq!(o.state, OrderState::Open);
    }

    #[test]
    fn stop_limits_start_pending_trigger() {
        let o = order(OrderType::StopLimit { stop: dec!(105), limit: dec!(106) });
        assert_eq!(o.state, OrderState::PendingTrigger);
        assert_eq!(o.order_type.stop_price(), Some(dec!(105)));
        assert_eq!(o.order_type.limit_price(), Some(dec!(106)));
    }

    #[test]
    fn fills_accumulate_and_close_the_order() {
        let mut o = order(OrderType::Market);
        o.accept();

        o.record_fill(dec!(0.5), dec!(50), "USDT", dec!(0.05));
        assert_eq!(o.state, OrderState::PartiallyFilled);
        assert_eq!(o.filled, dec!(0.5));
        assert_eq!(o.remaining(), dec!(1.5));

        o.record_fill(dec!(1.5), dec!(156), "USDT", dec!(0.16));
        assert_eq!(o.state, OrderState::Filled);
        assert_eq!(o.remaining(), Decimal::ZERO);
        assert_eq!(o.fees["USDT"], dec!(0.21));
        // 206 quote over 2 base.
        assert_eq!(o.avg_fill_price(), Some(dec!(103)));
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Canceled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(!OrderState::Open.is_terminal());
        assert!(!OrderState::PendingTrigger.is_terminal());
    }
}
