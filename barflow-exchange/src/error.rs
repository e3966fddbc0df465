//! Exchange boundary errors.
//!
//! One enum covers both façades: the backtesting simulator raises the first
//! four kinds, live collaborators additionally surface rate limiting and
//! connectivity failures after their own bounded retries.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::lending::LoanId;
use crate::order::OrderId;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("insufficient balance: need {required} {symbol}, available {available}")]
    InsufficientBalance {
        symbol: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("loan {0} not found")]
    LoanNotFound(LoanId),

    #[error("rate limited by the venue")]
    RateLimited,

    #[error("connectivity failure: {0}")]
    Connectivity(String),
}
