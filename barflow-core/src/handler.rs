//! Subscriber and timer callbacks.
//!
//! Handlers are cooperative tasks: they may suspend at their own await
//! points, and the dispatcher freezes the clock for a handler's whole
//! duration. Errors returned by a handler are logged and suppressed unless
//! the dispatcher runs in strict mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

use crate::event::Event;

/// Error type surfaced by user handlers. Anything sensible converts into it
/// with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber for dispatched events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: Event) -> Result<(), HandlerError>;
}

/// A scheduled callback. `when` is the instant it was scheduled for, which
/// in backtesting equals the virtual clock at invocation.
#[async_trait]
pub trait TimerHandler: Send + Sync {
    async fn on_timer(&self, when: DateTime<Utc>) -> Result<(), HandlerError>;
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnEventHandler(f))
}

/// Wrap an async closure as a [`TimerHandler`].
pub fn timer_fn<F, Fut>(f: F) -> Arc<dyn TimerHandler>
where
    F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnTimerHandler(f))
}

struct FnEventHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn on_event(&self, event: Event) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

struct FnTimerHandler<F>(F);

#[async_trait]
impl<F, Fut> TimerHandler for FnTimerHandler<F>
where
    F: Fn(DateTime<Utc>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn on_timer(&self, when: DateTime<Utc>) -> Result<(), HandlerError> {
        (self.0)(when).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, OrderBookUpdate};
    use crate::pair::Pair;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn closure_handlers_run() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let handler = handler_fn(move |_event| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = Event::new(
            when,
            EventPayload::OrderBook(OrderBookUpdate {
                pair: Pair::new("BTC", "USDT"),
                bids: vec![],
                asks: vec![],
            }),
        );
        handler.on_event(event).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closure_timers_receive_their_instant() {
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let timer = timer_fn(move |at| async move {
            assert_eq!(at.timestamp() % 60, 0);
            Ok(())
        });
        timer.on_timer(when).await.unwrap();
    }
}
