//! barflow exchange — the backtesting exchange simulator.
//!
//! Subscribes to bar events from a dispatcher and resolves market, limit,
//! and stop-limit orders against a configurable liquidity model, with fee
//! accounting, multi-currency balances, and optional margin lending. The
//! façade exposes the same surface a live venue collaborator implements, so
//! a strategy runs unchanged in either mode.

pub mod balances;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fees;
pub mod lending;
pub mod liquidity;
pub mod live;
pub mod matcher;
pub mod order;

pub use balances::{AccountBalances, Balance};
pub use config::{ExchangeConfig, FeeConfig, LiquidityConfig, MarginConfig};
pub use error::ExchangeError;
pub use exchange::BacktestExchange;
pub use fees::{FeeSchedule, FillRole, NoFees, PercentageFees};
pub use lending::{LendingPool, Loan, LoanId};
pub use liquidity::{LiquidityModel, UnlimitedLiquidity, VolumeShareLiquidity};
pub use live::{LiveExchange, LiveExchangeClient, OrderSpec};
pub use matcher::OrderManager;
pub use order::{Order, OrderId, OrderSide, OrderState, OrderType, Trade};
