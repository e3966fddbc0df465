//! Live-venue collaborator interface and the façade over it.
//!
//! Concrete REST/WebSocket connectors live outside this crate;
//! [`LiveExchangeClient`] is the contract they implement. [`LiveExchange`]
//! is the strategy-facing façade that routes the uniform order/subscription
//! surface to such a client — interchangeable by contract with the
//! backtesting façade, so a strategy runs unchanged against either.
//! Transient failures are the connector's to retry with bounded backoff;
//! `ConnectivityError` surfaces only after that budget is spent.

use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use barflow_core::{
    DispatcherHandle, EventHandler, EventKind, EventSource, Pair, Producer, SourceId,
};

use crate::balances::Balance;
use crate::error::ExchangeError;
use crate::order::{OrderId, OrderSide, OrderType};

/// Parameters of an order submission.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub pair: Pair,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
}

/// What a live venue must provide to the dispatcher and strategies.
#[async_trait]
pub trait LiveExchangeClient: Send + Sync {
    /// Idempotent lifecycle hooks. Once `start` has succeeded, `stop` is
    /// called on every dispatcher exit path.
    async fn start(&self) -> Result<(), ExchangeError>;
    async fn stop(&self) -> Result<(), ExchangeError>;

    /// Bar stream for a pair at the given period.
    async fn subscribe_bars(
        &self,
        pair: Pair,
        period: Duration,
    ) -> Result<Box<dyn EventSource>, ExchangeError>;

    /// Order book update stream for a pair.
    async fn subscribe_order_book(&self, pair: Pair)
        -> Result<Box<dyn EventSource>, ExchangeError>;

    async fn submit_order(&self, spec: OrderSpec) -> Result<OrderId, ExchangeError>;

    async fn cancel_order(&self, id: OrderId) -> Result<(), ExchangeError>;

    /// Per-symbol `(available, hold)` lines.
    async fn balances(&self) -> Result<BTreeMap<String, (Decimal, Decimal)>, ExchangeError>;
}

/// Live façade: the same surface as the backtesting exchange, routed to a
/// venue client. Client lifecycle rides on the dispatcher's producer
/// management, so `stop` runs on every exit path.
pub struct LiveExchange {
    client: Arc<dyn LiveExchangeClient>,
    dispatcher: DispatcherHandle,
}

impl LiveExchange {
    pub fn new(dispatcher: &DispatcherHandle, client: Arc<dyn LiveExchangeClient>) -> Arc<Self> {
        Arc::new(Self { client, dispatcher: dispatcher.clone() })
    }

    /// Subscribe a handler to bars of one pair, wiring the client's stream
    /// into the dispatcher.
    pub async fn subscribe_to_bar_events(
        &self,
        pair: Pair,
        period: Duration,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SourceId, ExchangeError> {
        let source = self.client.subscribe_bars(pair, period).await?;
        let id = self.add_client_source(source);
        self.dispatcher.subscribe_to_source(EventKind::Bar, id, handler);
        Ok(id)
    }

    /// Subscribe a handler to order book updates of one pair.
    pub async fn subscribe_to_order_book_events(
        &self,
        pair: Pair,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SourceId, ExchangeError> {
        let source = self.client.subscribe_order_book(pair).await?;
        let id = self.add_client_source(source);
        self.dispatcher.subscribe_to_source(EventKind::OrderBook, id, handler);
        Ok(id)
    }

    pub async fn create_market_order(
        &self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.client
            .submit_order(OrderSpec { pair, side, order_type: OrderType::Market, amount })
            .await
    }

    pub async fn create_limit_order(
        &self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
        limit: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.client
            .submit_order(OrderSpec { pair, side, order_type: OrderType::Limit { limit }, amount })
            .await
    }

    pub async fn create_stop_limit_order(
        &self,
        pair: Pair,
        side: OrderSide,
        amount: Decimal,
        stop: Decimal,
        limit: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.client
            .submit_order(OrderSpec {
                pair,
                side,
                order_type: OrderType::StopLimit { stop, limit },
                amount,
            })
            .await
    }

    pub async fn cancel_order(&self, id: OrderId) -> Result<(), ExchangeError> {
        self.client.cancel_order(id).await
    }

    /// Balance lines for one symbol. Live venues report no borrowed line
    /// through this interface.
    pub async fn get_balance(&self, symbol: &str) -> Result<Balance, ExchangeError> {
        let balances = self.client.balances().await?;
        let (available, hold) = balances.get(symbol).copied().unwrap_or_default();
        Ok(Balance { available, hold, borrowed: Decimal::ZERO })
    }

    /// Attach the client lifecycle as the source's producer, so the
    /// dispatcher starts it with the run and stops it on every exit path.
    fn add_client_source(&self, source: Box<dyn EventSource>) -> SourceId {
        let producer = Arc::new(ClientLifecycle { client: self.client.clone() });
        self.dispatcher.add_event_source(Box::new(ManagedSource { inner: source, producer }))
    }
}

/// Adapts the client's idempotent start/stop to the producer contract.
struct ClientLifecycle {
    client: Arc<dyn LiveExchangeClient>,
}

#[async_trait]
impl Producer for ClientLifecycle {
    async fn start(&self) {
        if let Err(err) = self.client.start().await {
            warn!(error = %err, "live client failed to start");
        }
    }

    async fn stop(&self) {
        if let Err(err) = self.client.stop().await {
            warn!(error = %err, "live client failed to stop");
        }
    }
}

/// Event source with an attached lifecycle producer.
struct ManagedSource {
    inner: Box<dyn EventSource>,
    producer: Arc<dyn Producer>,
}

impl EventSource for ManagedSource {
    fn peek_when(&mut self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner.peek_when()
    }

    fn pop(&mut self) -> Option<barflow_core::Event> {
        self.inner.pop()
    }

    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    fn producer(&self) -> Option<Arc<dyn Producer>> {
        Some(self.producer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barflow_core::{handler_fn, Bar, BarEvent, InMemorySource, RealtimeDispatcher};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn pair() -> Pair {
        Pair::new("BTC", "USDT")
    }

    /// In-memory venue: serves canned bars, records submissions.
    struct MockClient {
        started: AtomicBool,
        stopped: AtomicBool,
        submissions: Mutex<Vec<OrderSpec>>,
        cancels: Mutex<Vec<OrderId>>,
    }

    impl MockClient {
        fn new() -> Self {
            Self {
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                submissions: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LiveExchangeClient for MockClient {
        async fn start(&self) -> Result<(), ExchangeError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ExchangeError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn subscribe_bars(
            &self,
            pair: Pair,
            period: Duration,
        ) -> Result<Box<dyn EventSource>, ExchangeError> {
            let when = Utc::now();
            let event = BarEvent {
                pair,
                period,
                bar: Bar::new(dec!(100), dec!(100), dec!(100), dec!(100), dec!(1))
                    .map_err(|err| ExchangeError::Connectivity(err.to_string()))?,
            }
            .into_event(when);
            Ok(Box::new(InMemorySource::new(vec![event])))
        }

        async fn subscribe_order_book(
            &self,
            _pair: Pair,
        ) -> Result<Box<dyn EventSource>, ExchangeError> {
            Ok(Box::new(InMemorySource::empty()))
        }

        async fn submit_order(&self, spec: OrderSpec) -> Result<OrderId, ExchangeError> {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(spec);
            Ok(OrderId(submissions.len() as u64))
        }

        async fn cancel_order(&self, id: OrderId) -> Result<(), ExchangeError> {
            self.cancels.lock().unwrap().push(id);
            Ok(())
        }

        async fn balances(
            &self,
        ) -> Result<BTreeMap<String, (Decimal, Decimal)>, ExchangeError> {
            let mut map = BTreeMap::new();
            map.insert("USDT".to_string(), (dec!(1000), dec!(50)));
            Ok(map)
        }
    }

    #[tokio::test]
    async fn routes_orders_to_the_client() {
        let dispatcher = RealtimeDispatcher::new();
        let client = Arc::new(MockClient::new());
        let exchange = LiveExchange::new(&dispatcher.handle(), client.clone());

        let id = exchange
            .create_limit_order(pair(), OrderSide::Buy, dec!(1), dec!(95))
            .await
            .unwrap();
        exchange.cancel_order(id).await.unwrap();

        let submissions = client.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].order_type, OrderType::Limit { limit: dec!(95) });
        assert_eq!(*client.cancels.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn balance_queries_map_the_client_lines() {
        let dispatcher = RealtimeDispatcher::new();
        let exchange = LiveExchange::new(&dispatcher.handle(), Arc::new(MockClient::new()));

        let usdt = exchange.get_balance("USDT").await.unwrap();
        assert_eq!(usdt.available, dec!(1000));
        assert_eq!(usdt.hold, dec!(50));
        assert_eq!(usdt.borrowed, dec!(0));

        let eth = exchange.get_balance("ETH").await.unwrap();
        assert_eq!(eth.available, dec!(0));
    }

    #[tokio::test]
    async fn client_lifecycle_rides_the_dispatcher() {
        let dispatcher =
            RealtimeDispatcher::new().with_poll_interval(std::time::Duration::from_millis(5));
        let handle = dispatcher.handle();
        let client = Arc::new(MockClient::new());
        let exchange = LiveExchange::new(&handle, client.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let stopper = handle.clone();
        exchange
            .subscribe_to_bar_events(
                pair(),
                Duration::minutes(1),
                handler_fn(move |_| {
                    let counter = counter.clone();
                    let stopper = stopper.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        stopper.stop();
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        dispatcher.run().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(client.started.load(Ordering::SeqCst));
        assert!(client.stopped.load(Ordering::SeqCst));
    }
}
