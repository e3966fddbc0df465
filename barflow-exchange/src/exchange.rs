//! Backtesting exchange façade.
//!
//! The uniform surface a strategy consumes: bar subscriptions, order
//! creation and cancellation, balance and loan queries. Construction wires
//! the matcher into the dispatcher as a bar subscriber; strategies that
//! subscribe afterwards always observe post-matching state. With margin
//! enabled, a recurring accrual callback runs in simulated time and a
//! shutdown guard surfaces loans still open when the run ends.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use barflow_core::{
    DispatcherHandle, Event, EventHandler, EventKind, EventSource, HandlerError, Pair, SourceId,
    StopHandler, TimerHandler,
};

use crate::balances::Balance;
use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::lending::{LoanId, Repayment};
use crate::matcher::OrderManager;
use crate::order::{Order, OrderId, OrderSide, Trade};

/// Simulated exchange bound to a backtesting dispatcher.
pub struct BacktestExchange {
    manager: Arc<Mutex<OrderManager>>,
    dispatcher: DispatcherHandle,
    accrual_period: Option<Duration>,
}

impl BacktestExchange {
    /// Build the exchange and wire it into the dispatcher. The matcher
    /// subscribes to bar events first, so strategy handlers registered
    /// afterwards see fills and balances already settled for the bar.
    pub fn new(
        dispatcher: &DispatcherHandle,
        config: ExchangeConfig,
    ) -> Result<Arc<Self>, ExchangeError> {
        let accrual_period = config
            .margin
            .as_ref()
            .map(|margin| Duration::seconds(margin.accrual_period_secs as i64));
        let manager = Arc::new(Mutex::new(OrderManager::from_config(&config)?));

        let exchange = Arc::new(Self {
            manager: manager.clone(),
            dispatcher: dispatcher.clone(),
            accrual_period,
        });

        dispatcher.subscribe(
            EventKind::Bar,
            Arc::new(MatchingHandler {
                exchange: exchange.clone(),
                accrual_scheduled: Arc::new(Mutex::new(false)),
            }),
        );
        if exchange.margin_enabled() {
            dispatcher.add_stop_handler(Arc::new(OpenLoanGuard { manager }));
        }
        Ok(exchange)
    }

    /// Feed a bar source (CSV replay, fixture, live adapter) into the run.
    pub fn add_bar_source(&self, source: Box<dyn EventSource>) -> SourceId {
        self.dispatcher.add_event_source(source)
    }

    /// Subscribe a strategy handler to bars of one pair.
    pub fn subscribe_to_bar_events(&self, pair: Pair, handler: Arc<dyn EventHandler>) {
        self.dispatcher.subscribe(EventKind::Bar, Arc::new(PairBarFilter { pair, inner: handler }));
    }

    pub async fn create_market_order(
        &self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        let now = self.clock();
        self.lock().create_market_order(pair, side, amount, now)
    }

    pub async fn create_limit_order(
        &self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
        limit: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        let now = self.clock();
        self.lock().create_limit_order(pair, side, amount, limit, now)
    }

    pub async fn create_stop_limit_order(
        &self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
        stop: Decimal,
        limit: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        let now = self.clock();
        self.lock().create_stop_limit_order(pair, side, amount, stop, limit, now)
    }

    pub async fn cancel_order(&self, id: OrderId) -> Result<(), ExchangeError> {
        self.lock().cancel_order(id)
    }

    pub async fn get_order_info(&self, id: OrderId) -> Result<Order, ExchangeError> {
        self.lock().get_order_info(id).ok_or(ExchangeError::OrderNotFound(id))
    }

    pub async fn get_open_orders(&self, pair: &Pair) -> Vec<Order> {
        self.lock().open_orders_for_pair(pair)
    }

    pub async fn get_balance(&self, symbol: &str) -> Balance {
        self.lock().balances().balance(symbol)
    }

    /// Executed fills so far, in execution order.
    pub async fn trades(&self) -> Vec<Trade> {
        self.lock().trades().to_vec()
    }

    pub async fn last_price(&self, pair: &Pair) -> Option<Decimal> {
        self.lock().last_price(pair)
    }

    pub async fn deposit(&self, symbol: &str, amount: Decimal) {
        self.lock().deposit(symbol, amount);
    }

    // ── Margin ───────────────────────────────────────────────────────

    pub async fn borrow(&self, symbol: &str, amount: Decimal) -> Result<LoanId, ExchangeError> {
        let now = self.clock();
        self.lock().borrow(symbol, amount, now)
    }

    pub async fn repay(&self, id: LoanId, amount: Decimal) -> Result<Repayment, ExchangeError> {
        let now = self.clock();
        self.lock().repay(id, amount, now)
    }

    /// Outstanding amount (principal plus accrued interest) for a loan.
    pub async fn loan_outstanding(&self, id: LoanId) -> Result<Decimal, ExchangeError> {
        self.lock()
            .get_loan(id)
            .map(|loan| loan.outstanding())
            .ok_or(ExchangeError::LoanNotFound(id))
    }

    pub fn margin_enabled(&self) -> bool {
        self.lock().margin_enabled()
    }

    fn lock(&self) -> MutexGuard<'_, OrderManager> {
        self.manager.lock().expect("order manager poisoned")
    }

    /// The dispatcher clock; before the first event the virtual clock has
    /// no value yet and orders are stamped at the epoch.
    fn clock(&self) -> DateTime<Utc> {
        self.dispatcher.now().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// The exchange's own bar subscriber: runs the matcher, then keeps the
/// margin accrual chain armed while bars flow.
struct MatchingHandler {
    exchange: Arc<BacktestExchange>,
    accrual_scheduled: Arc<Mutex<bool>>,
}

#[async_trait]
impl EventHandler for MatchingHandler {
    async fn on_event(&self, event: Event) -> Result<(), HandlerError> {
        let Some(bar_event) = event.bar_event() else {
            return Ok(());
        };

        let fills = self.exchange.lock().process_bar(event.when, bar_event)?;
        for fill in &fills {
            debug!(
                order = %fill.order_id,
                pair = %fill.pair,
                amount = %fill.amount,
                price = %fill.price,
                "fill"
            );
        }

        if let Some(period) = self.exchange.accrual_period {
            let mut scheduled = self.accrual_scheduled.lock().expect("accrual flag poisoned");
            if !*scheduled {
                *scheduled = true;
                self.exchange.dispatcher.schedule(
                    event.when + period,
                    Arc::new(AccrualTimer {
                        manager: self.exchange.manager.clone(),
                        dispatcher: self.exchange.dispatcher.clone(),
                        period,
                        scheduled: self.accrual_scheduled.clone(),
                    }),
                )?;
            }
        }
        Ok(())
    }
}

/// Recurring interest accrual in simulated time. The chain keeps itself
/// alive only while loans are open and bars keep arriving; otherwise it
/// disarms so an idle pool never keeps an exhausted backtest running.
/// Accrual is pro-rata, so a chain re-armed by a later bar charges the
/// same total interest.
struct AccrualTimer {
    manager: Arc<Mutex<OrderManager>>,
    dispatcher: DispatcherHandle,
    period: Duration,
    scheduled: Arc<Mutex<bool>>,
}

#[async_trait]
impl TimerHandler for AccrualTimer {
    async fn on_timer(&self, when: DateTime<Utc>) -> Result<(), HandlerError> {
        let reschedule = {
            let mut manager = self.manager.lock().expect("order manager poisoned");
            manager.accrue(when);
            manager.has_open_loans()
                && manager.last_bar_at().is_some_and(|last| when <= last + self.period)
        };
        if reschedule {
            self.dispatcher.schedule(
                when + self.period,
                Arc::new(AccrualTimer {
                    manager: self.manager.clone(),
                    dispatcher: self.dispatcher.clone(),
                    period: self.period,
                    scheduled: self.scheduled.clone(),
                }),
            )?;
        } else {
            *self.scheduled.lock().expect("accrual flag poisoned") = false;
        }
        Ok(())
    }
}

/// Shutdown guard: loans still open when the dispatcher stops are a
/// reporting concern, not an error.
struct OpenLoanGuard {
    manager: Arc<Mutex<OrderManager>>,
}

impl StopHandler for OpenLoanGuard {
    fn on_stop(&self) {
        let manager = self.manager.lock().expect("order manager poisoned");
        for loan in manager.open_loans() {
            warn!(
                loan = %loan.id,
                symbol = %loan.symbol,
                principal = %loan.principal,
                interest = %loan.accrued_interest,
                "loan still open at shutdown"
            );
        }
    }
}

/// Routes bar events of one pair to the wrapped handler.
struct PairBarFilter {
    pair: Pair,
    inner: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for PairBarFilter {
    async fn on_event(&self, event: Event) -> Result<(), HandlerError> {
        let matches = event.bar_event().map(|bar| bar.pair == self.pair).unwrap_or(false);
        if matches {
            self.inner.on_event(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barflow_core::{handler_fn, BacktestingDispatcher, Bar, BarEvent, InMemorySource};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair() -> Pair {
        Pair::new("BTC", "USDT")
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn bar(when: DateTime<Utc>, pair: Pair, close: Decimal) -> Event {
        BarEvent {
            pair,
            period: Duration::hours(1),
            bar: Bar::new(close, close, close, close, dec!(100)).unwrap(),
        }
        .into_event(when)
    }

    fn config() -> ExchangeConfig {
        ExchangeConfig::new().with_pair(&pair(), 8, 2).with_deposit("USDT", dec!(10000))
    }

    #[tokio::test]
    async fn pair_subscriptions_filter_other_pairs() {
        let dispatcher = BacktestingDispatcher::new();
        let exchange = BacktestExchange::new(&dispatcher.handle(), config()).unwrap();

        exchange.add_bar_source(Box::new(InMemorySource::new(vec![
            bar(at(1), pair(), dec!(100)),
            bar(at(2), Pair::new("ETH", "USDT"), dec!(2000)),
            bar(at(3), pair(), dec!(101)),
        ])));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        exchange.subscribe_to_bar_events(
            pair(),
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        dispatcher.run().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn strategy_handlers_observe_settled_fills() {
        let dispatcher = BacktestingDispatcher::new();
        let exchange = BacktestExchange::new(&dispatcher.handle(), config()).unwrap();

        exchange
            .add_bar_source(Box::new(InMemorySource::new(vec![bar(at(1), pair(), dec!(100))])));

        exchange.create_market_order(pair(), OrderSide::Buy, dec!(1)).await.unwrap();

        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let handle = exchange.clone();
        exchange.subscribe_to_bar_events(
            pair(),
            handler_fn(move |_| {
                let sink = sink.clone();
                let handle = handle.clone();
                async move {
                    // Matching ran before this handler: the buy is settled.
                    *sink.lock().unwrap() = Some(handle.get_balance("BTC").await.available);
                    Ok(())
                }
            }),
        );

        dispatcher.run().await.unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(dec!(1)));
    }

    #[tokio::test]
    async fn get_order_info_reports_unknown_orders() {
        let dispatcher = BacktestingDispatcher::new();
        let exchange = BacktestExchange::new(&dispatcher.handle(), config()).unwrap();
        let err = exchange.get_order_info(OrderId(99)).await;
        assert!(matches!(err, Err(ExchangeError::OrderNotFound(_))));
    }
}
