//! Events — timestamped occurrences delivered through the dispatcher.
//!
//! An [`Event`] pairs an offset-aware instant with a tagged payload. The
//! [`EventKind`] tag mirrors the payload variants so subscription lookup is
//! a table access, never a runtime type test.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::pair::Pair;

/// A timestamped occurrence. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Event {
    /// When the event happened. Always UTC, always offset-aware.
    pub when: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(when: DateTime<Utc>, payload: EventPayload) -> Self {
        Self { when, payload }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The bar payload, if this is a bar event.
    pub fn bar_event(&self) -> Option<&BarEvent> {
        match &self.payload {
            EventPayload::Bar(bar) => Some(bar),
            _ => None,
        }
    }

    pub fn order_book(&self) -> Option<&OrderBookUpdate> {
        match &self.payload {
            EventPayload::OrderBook(update) => Some(update),
            _ => None,
        }
    }
}

/// Payload variants carried by an [`Event`].
#[derive(Debug, Clone)]
pub enum EventPayload {
    Bar(BarEvent),
    OrderBook(OrderBookUpdate),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Bar(_) => EventKind::Bar,
            EventPayload::OrderBook(_) => EventKind::OrderBook,
        }
    }
}

/// Subscription tag for an event payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Bar,
    OrderBook,
}

/// OHLCV aggregate over one period of a pair. The owning event is stamped
/// at the bar close.
#[derive(Debug, Clone)]
pub struct BarEvent {
    pub pair: Pair,
    pub period: Duration,
    pub bar: Bar,
}

impl BarEvent {
    /// Build the dispatchable event, stamped at the bar close.
    pub fn into_event(self, close: DateTime<Utc>) -> Event {
        Event::new(close, EventPayload::Bar(self))
    }
}

/// Single OHLCV bar. All fields are fixed-point decimals.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn new(
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Result<Self, BarError> {
        let bar = Self { open, high, low, close, volume };
        bar.validate()?;
        Ok(bar)
    }

    /// Validate bar invariants: `low <= open,close <= high`, `volume >= 0`.
    pub fn validate(&self) -> Result<(), BarError> {
        if self.high < self.low {
            return Err(BarError::InvalidRange { high: self.high, low: self.low });
        }
        if !(self.low..=self.high).contains(&self.open) {
            return Err(BarError::OpenOutOfRange);
        }
        if !(self.low..=self.high).contains(&self.close) {
            return Err(BarError::CloseOutOfRange);
        }
        if self.volume.is_sign_negative() {
            return Err(BarError::NegativeVolume);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BarError {
    #[error("invalid bar range: high={high}, low={low}")]
    InvalidRange { high: Decimal, low: Decimal },

    #[error("negative volume not allowed")]
    NegativeVolume,

    #[error("open price outside high/low range")]
    OpenOutOfRange,

    #[error("close price outside high/low range")]
    CloseOutOfRange,
}

/// One side level of an order book snapshot or delta.
#[derive(Debug, Clone, PartialEq)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Order book update from a live feed. Bids descend, asks ascend; zero
/// sizes never appear.
#[derive(Debug, Clone)]
pub struct OrderBookUpdate {
    pub pair: Pair,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn pair() -> Pair {
        Pair::new("BTC", "USDT")
    }

    #[test]
    fn bar_validate_accepts_valid_bar() {
        let bar = Bar::new(dec!(100), dec!(105), dec!(95), dec!(102), dec!(1000));
        assert!(bar.is_ok());
    }

    #[test]
    fn bar_validate_rejects_inverted_range() {
        let bar = Bar::new(dec!(100), dec!(99), dec!(101), dec!(100), dec!(1000));
        assert!(matches!(bar, Err(BarError::InvalidRange { .. })));
    }

    #[test]
    fn bar_validate_rejects_open_outside_range() {
        let bar = Bar::new(dec!(110), dec!(105), dec!(95), dec!(102), dec!(1000));
        assert!(matches!(bar, Err(BarError::OpenOutOfRange)));
    }

    #[test]
    fn bar_validate_rejects_negative_volume() {
        let bar = Bar::new(dec!(100), dec!(105), dec!(95), dec!(102), dec!(-1));
        assert!(matches!(bar, Err(BarError::NegativeVolume)));
    }

    #[test]
    fn bar_event_is_stamped_at_close() {
        let close = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let event = BarEvent {
            pair: pair(),
            period: Duration::hours(1),
            bar: Bar::new(dec!(100), dec!(105), dec!(95), dec!(102), dec!(10)).unwrap(),
        }
        .into_event(close);

        assert_eq!(event.when, close);
        assert_eq!(event.kind(), EventKind::Bar);
        assert!(event.bar_event().is_some());
        assert!(event.order_book().is_none());
    }
}
