//! Order manager and matching engine.
//!
//! Owns every order, the account ledger, and the optional lending pool.
//! Order creation validates and reserves funds synchronously; matching
//! happens only when bars arrive. Per bar: trigger stops whose price lies
//! inside the bar range, then fill open orders in deterministic priority
//! against the liquidity bucket.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use barflow_core::{round_fee_up, round_price, Bar, BarEvent, Pair, PairInfo};

use crate::balances::AccountBalances;
use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::fees::{FeeSchedule, FillRole, PercentageFees};
use crate::lending::{LendingPool, Loan, LoanId, Repayment};
use crate::liquidity::{LiquidityModel, VolumeShareLiquidity};
use crate::order::{Hold, Order, OrderId, OrderSide, OrderState, OrderType, Trade};

/// Owns orders, balances, and lending; serves as the matching engine.
pub struct OrderManager {
    pairs: HashMap<Pair, PairInfo>,
    fees: Arc<dyn FeeSchedule>,
    liquidity: Arc<dyn LiquidityModel>,
    balances: AccountBalances,
    lending: Option<LendingPool>,
    auto_borrow: bool,
    orders: BTreeMap<OrderId, Order>,
    next_id: u64,
    next_seq: u64,
    last_price: HashMap<Pair, Decimal>,
    last_bar_at: Option<DateTime<Utc>>,
    trades: Vec<Trade>,
}

impl OrderManager {
    pub fn new(
        pairs: HashMap<Pair, PairInfo>,
        fees: Arc<dyn FeeSchedule>,
        liquidity: Arc<dyn LiquidityModel>,
        balances: AccountBalances,
        lending: Option<LendingPool>,
        auto_borrow: bool,
    ) -> Self {
        Self {
            pairs,
            fees,
            liquidity,
            balances,
            lending,
            auto_borrow,
            orders: BTreeMap::new(),
            next_id: 1,
            next_seq: 0,
            last_price: HashMap::new(),
            last_bar_at: None,
            trades: Vec::new(),
        }
    }

    pub fn from_config(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let pairs = config
            .pair_table()
            .map_err(|err| ExchangeError::InvalidOrder(err.to_string()))?;
        let fees = PercentageFees::from_bps(config.fees.maker_bps, config.fees.taker_bps);
        let liquidity =
            VolumeShareLiquidity::new(config.liquidity.volume_limit, config.liquidity.price_impact);
        let balances = AccountBalances::with_deposits(
            config.deposits.iter().map(|(symbol, amount)| (symbol.clone(), *amount)),
        );
        let (lending, auto_borrow) = match &config.margin {
            Some(margin) => {
                let mut pool = LendingPool::new(margin.default_hourly_rate);
                for (symbol, rate) in &margin.hourly_rates {
                    pool = pool.with_rate(symbol.clone(), *rate);
                }
                for (symbol, limit) in &margin.borrow_limits {
                    pool = pool.with_borrow_limit(symbol.clone(), *limit);
                }
                (Some(pool), margin.auto_borrow)
            }
            None => (None, false),
        };
        Ok(Self::new(pairs, Arc::new(fees), Arc::new(liquidity), balances, lending, auto_borrow))
    }

    // ── Order creation ───────────────────────────────────────────────

    pub fn create_market_order(
        &mut self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<OrderId, ExchangeError> {
        let info = self.validate_common(&pair, side, amount, None)?;
        let taker = FillRole::Taker;

        match side {
            OrderSide::Buy => {
                // A market buy's cost is unknown until fill; check against
                // the last seen price when one exists, otherwise accept and
                // bound the fill at commit time.
                if let Some(last) = self.last_price.get(&pair).copied() {
                    let cost = round_price(last * amount, info.quote_precision);
                    let required = cost + self.fees.fee(cost, taker, info.quote_precision);
                    self.ensure_available(&pair.quote, required, info.quote_precision, now)?;
                }
            }
            OrderSide::Sell => {
                self.ensure_available(&pair.base, amount, info.base_precision, now)?;
            }
        }

        Ok(self.insert_order(pair, side, OrderType::Market, amount, None, now))
    }

    pub fn create_limit_order(
        &mut self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
        limit: Decimal,
        now: DateTime<Utc>,
    ) -> Result<OrderId, ExchangeError> {
        let info = self.validate_common(&pair, side, amount, Some(limit))?;
        let hold = self.take_hold(&pair, side, amount, limit, info, now)?;
        Ok(self.insert_order(pair, side, OrderType::Limit { limit }, amount, Some(hold), now))
    }

    pub fn create_stop_limit_order(
        &mut self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
        stop: Decimal,
        limit: Decimal,
        now: DateTime<Utc>,
    ) -> Result<OrderId, ExchangeError> {
        let info = self.validate_common(&pair, side, amount, Some(limit))?;
        if stop <= Decimal::ZERO || info.round_price(stop) != stop {
            return Err(ExchangeError::InvalidOrder(format!(
                "stop price {stop} violates quote precision"
            )));
        }
        // A stop on the wrong side of the market would trigger instantly;
        // that is a limit order misspelled as a stop.
        if let Some(last) = self.last_price.get(&pair).copied() {
            let wrong_side = match side {
                OrderSide::Buy => stop <= last,
                OrderSide::Sell => stop >= last,
            };
            if wrong_side {
                return Err(ExchangeError::InvalidOrder(format!(
                    "stop {stop} is on the wrong side of the market ({last})"
                )));
            }
        }
        let hold = self.take_hold(&pair, side, amount, limit, info, now)?;
        Ok(self.insert_order(pair, side, OrderType::StopLimit { stop, limit }, amount, Some(hold), now))
    }

    /// Cancel an order, releasing its remaining hold atomically.
    pub fn cancel_order(&mut self, id: OrderId) -> Result<(), ExchangeError> {
        let order = self.orders.get_mut(&id).ok_or(ExchangeError::OrderNotFound(id))?;
        if order.state.is_terminal() {
            return Err(ExchangeError::InvalidOrder(format!("order {id} is already closed")));
        }
        order.state = OrderState::Canceled;
        if let Some(hold) = order.hold.take() {
            if hold.remaining > Decimal::ZERO {
                self.balances.release(&hold.symbol, hold.remaining)?;
            }
        }
        Ok(())
    }

    pub fn get_order_info(&self, id: OrderId) -> Option<Order> {
        self.orders.get(&id).cloned()
    }

    pub fn open_orders_for_pair(&self, pair: &Pair) -> Vec<Order> {
        self.orders
            .values()
            .filter(|order| order.pair == *pair && !order.state.is_terminal())
            .cloned()
            .collect()
    }

    // ── Matching ─────────────────────────────────────────────────────

    /// Resolve one bar for its pair: trigger stops, then fill open orders
    /// in (stop-triggered, price priority, FIFO) order against the bar's
    /// liquidity bucket. Returns the fills executed within this bar.
    pub fn process_bar(
        &mut self,
        when: DateTime<Utc>,
        bar_event: &BarEvent,
    ) -> Result<Vec<Trade>, ExchangeError> {
        let pair = bar_event.pair.clone();
        let bar = &bar_event.bar;
        self.last_price.insert(pair.clone(), bar.close);
        self.last_bar_at = Some(when);

        let Some(info) = self.pairs.get(&pair).copied() else {
            return Ok(Vec::new());
        };

        // 1. Stop triggers: the stop price lies within the bar range.
        for order in self.orders.values_mut() {
            if order.pair != pair || order.state != OrderState::PendingTrigger {
                continue;
            }
            if let Some(stop) = order.order_type.stop_price() {
                let hit = match order.side {
                    OrderSide::Buy => bar.high >= stop,
                    OrderSide::Sell => bar.low <= stop,
                };
                if hit {
                    order.trigger();
                }
            }
        }

        // 2. Deterministic priority: stop-triggered first, then market
        // before limit, then within-side limit aggressiveness, then FIFO.
        let mut queue: Vec<(bool, u8, Decimal, u64, OrderId)> = self
            .orders
            .values()
            .filter(|order| order.pair == pair && order.is_open())
            .map(|order| {
                let class = match order.order_type {
                    OrderType::Market => 0u8,
                    _ => 1,
                };
                let price_key = match (order.order_type.limit_price(), order.side) {
                    (Some(limit), OrderSide::Buy) => -limit,
                    (Some(limit), OrderSide::Sell) => limit,
                    (None, _) => Decimal::ZERO,
                };
                (!order.triggered_this_bar, class, price_key, order.seq, order.id)
            })
            .collect();
        queue.sort();

        // 3. Fill within the liquidity bucket, in execution order.
        let available = self.liquidity.available_volume(bar);
        let mut consumed = Decimal::ZERO;
        let mut fills = Vec::new();

        for (_, _, _, _, id) in queue {
            if consumed >= available {
                break;
            }
            let Some(mut order) = self.orders.remove(&id) else {
                continue;
            };
            let result = self.try_fill(&mut order, bar, info, when, available, &mut consumed);
            self.orders.insert(id, order);
            if let Some(trade) = result? {
                fills.push(trade);
            }
        }

        // 4. Survivors have now rested on the book for a full bar.
        for order in self.orders.values_mut() {
            if order.pair == pair {
                order.triggered_this_bar = false;
                if order.is_open() {
                    order.resting = true;
                }
            }
        }

        self.trades.extend(fills.iter().cloned());
        Ok(fills)
    }

    /// Attempt one fill. Fill size is bounded by the order remainder, the
    /// bucket remainder, and affordable funds; never overdrafts.
    fn try_fill(
        &mut self,
        order: &mut Order,
        bar: &Bar,
        info: PairInfo,
        when: DateTime<Utc>,
        available: Decimal,
        consumed: &mut Decimal,
    ) -> Result<Option<Trade>, ExchangeError> {
        let role = if order.resting { FillRole::Maker } else { FillRole::Taker };
        let quote = order.pair.quote.clone();
        let base = order.pair.base.clone();
        let qp = info.quote_precision;

        let representative =
            info.round_price(self.liquidity.representative_price(bar, order.side, *consumed, available));
        let price = match (order.order_type.limit_price(), order.side) {
            (None, _) => Some(representative),
            (Some(limit), OrderSide::Buy) => (bar.low <= limit).then(|| limit.min(representative)),
            (Some(limit), OrderSide::Sell) => (bar.high >= limit).then(|| limit.max(representative)),
        };
        let Some(price) = price else {
            return Ok(None);
        };
        if price <= Decimal::ZERO {
            return Ok(None);
        }

        let cap = available - *consumed;
        let mut amount = info.truncate_amount(order.remaining().min(cap));
        if amount <= Decimal::ZERO {
            return Ok(None);
        }

        let trade = match order.side {
            OrderSide::Buy => {
                let funds = match &order.hold {
                    Some(hold) => hold.remaining,
                    None => self.balances.available(&quote),
                };
                let rate = self.fees.rate(role);
                let one_unit = Decimal::new(1, info.base_precision);
                let (cost, fee) = loop {
                    if amount <= Decimal::ZERO {
                        break (Decimal::ZERO, Decimal::ZERO);
                    }
                    let cost = round_price(price * amount, qp);
                    let fee = self.fees.fee(cost, role, qp);
                    if cost + fee <= funds {
                        break (cost, fee);
                    }
                    // Reduce toward the maximum feasible amount. The step
                    // clears the current excess outright, so only fresh
                    // rounding can overshoot again and the loop converges
                    // in a handful of iterations.
                    let excess = cost + fee - funds;
                    let step = info.truncate_amount(excess / price) + one_unit;
                    let feasible = info.truncate_amount(funds / (price * (Decimal::ONE + rate)));
                    amount = feasible.min(amount - step);
                };
                if amount <= Decimal::ZERO {
                    // Nothing affordable. An unheld market order that can
                    // never fill is dead; reject it.
                    if order.order_type == OrderType::Market && order.filled.is_zero() {
                        order.state = OrderState::Rejected;
                        debug!(order = %order.id, "market buy rejected: no affordable amount");
                    }
                    return Ok(None);
                }

                match &mut order.hold {
                    Some(hold) => {
                        self.balances.consume_hold(&quote, cost + fee)?;
                        hold.remaining -= cost + fee;
                    }
                    None => self.balances.withdraw(&quote, cost + fee)?,
                }
                self.balances.deposit(&base, amount);
                order.record_fill(amount, cost, &quote, fee);

                Trade {
                    order_id: order.id,
                    pair: order.pair.clone(),
                    side: order.side,
                    amount,
                    price,
                    fees: std::iter::once((quote, fee)).filter(|(_, f)| !f.is_zero()).collect(),
                    when,
                }
            }
            OrderSide::Sell => {
                let funds = match &order.hold {
                    Some(hold) => hold.remaining,
                    None => self.balances.available(&base),
                };
                amount = info.truncate_amount(amount.min(funds));
                if amount <= Decimal::ZERO {
                    if order.order_type == OrderType::Market && order.filled.is_zero() {
                        order.state = OrderState::Rejected;
                        debug!(order = %order.id, "market sell rejected: no base funds");
                    }
                    return Ok(None);
                }
                let proceeds = round_price(price * amount, qp);
                let fee = self.fees.fee(proceeds, role, qp);
                let credit = (proceeds - fee).max(Decimal::ZERO);

                match &mut order.hold {
                    Some(hold) => {
                        self.balances.consume_hold(&base, amount)?;
                        hold.remaining -= amount;
                    }
                    None => self.balances.withdraw(&base, amount)?,
                }
                self.balances.deposit(&quote, credit);
                order.record_fill(amount, proceeds, &quote, fee);

                Trade {
                    order_id: order.id,
                    pair: order.pair.clone(),
                    side: order.side,
                    amount,
                    price,
                    fees: std::iter::once((quote, fee)).filter(|(_, f)| !f.is_zero()).collect(),
                    when,
                }
            }
        };

        *consumed += trade.amount;

        // Fully filled orders give back whatever reservation is left over
        // from the worst-case estimate.
        if order.state == OrderState::Filled {
            if let Some(hold) = order.hold.take() {
                if hold.remaining > Decimal::ZERO {
                    self.balances.release(&hold.symbol, hold.remaining)?;
                }
            }
        }

        Ok(Some(trade))
    }

    // ── Funds & lending ──────────────────────────────────────────────

    /// Require `required` of `symbol` available, borrowing the shortfall
    /// when margin auto-borrow is on.
    fn ensure_available(
        &mut self,
        symbol: &str,
        required: Decimal,
        precision: u32,
        now: DateTime<Utc>,
    ) -> Result<(), ExchangeError> {
        let available = self.balances.available(symbol);
        if available >= required {
            return Ok(());
        }
        if self.auto_borrow {
            if let Some(pool) = self.lending.as_mut() {
                let shortfall = round_fee_up(required - available, precision);
                pool.borrow(symbol, shortfall, now)?;
                self.balances.credit_borrowed(symbol, shortfall);
                debug!(%symbol, %shortfall, "auto-borrowed order shortfall");
                return Ok(());
            }
        }
        Err(ExchangeError::InsufficientBalance {
            symbol: symbol.to_string(),
            required,
            available,
        })
    }

    pub fn borrow(
        &mut self,
        symbol: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<LoanId, ExchangeError> {
        let pool = self
            .lending
            .as_mut()
            .ok_or_else(|| ExchangeError::InvalidOrder("margin is not enabled".into()))?;
        let id = pool.borrow(symbol, amount, now)?;
        self.balances.credit_borrowed(symbol, amount);
        Ok(id)
    }

    /// Repay against a loan: interest first, then principal. The full
    /// amount leaves `available`; only the principal part lowers
    /// `borrowed`.
    pub fn repay(
        &mut self,
        id: LoanId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Repayment, ExchangeError> {
        let symbol = self
            .lending
            .as_ref()
            .ok_or_else(|| ExchangeError::InvalidOrder("margin is not enabled".into()))?
            .loan(id)
            .ok_or(ExchangeError::LoanNotFound(id))?
            .symbol
            .clone();

        let available = self.balances.available(&symbol);
        if available < amount {
            return Err(ExchangeError::InsufficientBalance { symbol, required: amount, available });
        }

        let Some(pool) = self.lending.as_mut() else {
            return Err(ExchangeError::InvalidOrder("margin is not enabled".into()));
        };
        let repayment = pool.repay(id, amount, now)?;

        self.balances.withdraw(&symbol, repayment.interest_paid)?;
        self.balances.settle_borrowed(&symbol, repayment.principal_paid)?;
        Ok(repayment)
    }

    pub fn accrue(&mut self, until: DateTime<Utc>) {
        if let Some(pool) = self.lending.as_mut() {
            pool.accrue(until);
        }
    }

    pub fn get_loan(&self, id: LoanId) -> Option<&Loan> {
        self.lending.as_ref().and_then(|pool| pool.loan(id))
    }

    pub fn open_loans(&self) -> Vec<&Loan> {
        self.lending.as_ref().map(|pool| pool.open_loans().collect()).unwrap_or_default()
    }

    pub fn has_open_loans(&self) -> bool {
        self.lending.as_ref().is_some_and(LendingPool::has_open_loans)
    }

    pub fn margin_enabled(&self) -> bool {
        self.lending.is_some()
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn balances(&self) -> &AccountBalances {
        &self.balances
    }

    pub fn deposit(&mut self, symbol: &str, amount: Decimal) {
        self.balances.deposit(symbol, amount);
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn last_price(&self, pair: &Pair) -> Option<Decimal> {
        self.last_price.get(pair).copied()
    }

    /// When the most recent bar (any pair) was processed.
    pub fn last_bar_at(&self) -> Option<DateTime<Utc>> {
        self.last_bar_at
    }

    // ── Internals ────────────────────────────────────────────────────

    fn validate_common(
        &self,
        pair: &Pair,
        _side: OrderSide,
        amount: Decimal,
        limit: Option<Decimal>,
    ) -> Result<PairInfo, ExchangeError> {
        let info = self
            .pairs
            .get(pair)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidOrder(format!("unknown pair {pair}")))?;
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!("amount {amount} must be positive")));
        }
        if info.truncate_amount(amount) != amount {
            return Err(ExchangeError::InvalidOrder(format!(
                "amount {amount} violates base precision {}",
                info.base_precision
            )));
        }
        if let Some(limit) = limit {
            if limit <= Decimal::ZERO || info.round_price(limit) != limit {
                return Err(ExchangeError::InvalidOrder(format!(
                    "limit price {limit} violates quote precision {}",
                    info.quote_precision
                )));
            }
        }
        Ok(info)
    }

    /// Reserve worst-case funds for a resting order: quote cost plus fees
    /// for buys, the base amount for sells.
    fn take_hold(
        &mut self,
        pair: &Pair,
        side: OrderSide,
        amount: Decimal,
        limit: Decimal,
        info: PairInfo,
        now: DateTime<Utc>,
    ) -> Result<Hold, ExchangeError> {
        match side {
            OrderSide::Buy => {
                let cost = round_fee_up(limit * amount, info.quote_precision);
                let fee = self.fees.fee(cost, FillRole::Taker, info.quote_precision);
                let required = cost + fee;
                self.ensure_available(&pair.quote, required, info.quote_precision, now)?;
                self.balances.hold(&pair.quote, required)?;
                Ok(Hold { symbol: pair.quote.clone(), remaining: required })
            }
            OrderSide::Sell => {
                self.ensure_available(&pair.base, amount, info.base_precision, now)?;
                self.balances.hold(&pair.base, amount)?;
                Ok(Hold { symbol: pair.base.clone(), remaining: amount })
            }
        }
    }

    fn insert_order(
        &mut self,
        pair: Pair,
        side: OrderSide,
        order_type: OrderType,
        amount: Decimal,
        hold: Option<Hold>,
        now: DateTime<Utc>,
    ) -> OrderId {
        let id = OrderId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut order = Order::new(id, seq, pair, side, order_type, amount, now);
        order.hold = hold;
        order.accept();
        self.orders.insert(id, order);
        id
    }
}
