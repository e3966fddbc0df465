//! Live order book state — sorted bid/ask levels maintained by deltas.
//!
//! A book is owned by the feed that maintains it and read through the
//! façade on the dispatcher task, so no locking is needed. Keys are
//! strictly monotone (best bid below best ask) and zero-size levels never
//! rest in the book; a delta carrying size zero deletes its level.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::event::{BookLevel, OrderBookUpdate};
use crate::pair::Pair;

/// Aggregated price levels for one pair.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pair: Pair,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl OrderBook {
    pub fn new(pair: Pair) -> Self {
        Self { pair, bids: BTreeMap::new(), asks: BTreeMap::new() }
    }

    /// Rebuild the book from a full snapshot.
    pub fn from_snapshot(update: &OrderBookUpdate) -> Self {
        let mut book = Self::new(update.pair.clone());
        book.apply(update);
        book
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    /// Apply a delta: non-zero sizes replace their level, zero sizes
    /// delete it. Updates for other pairs are ignored.
    pub fn apply(&mut self, update: &OrderBookUpdate) {
        if update.pair != self.pair {
            return;
        }
        for level in &update.bids {
            Self::apply_level(&mut self.bids, level);
        }
        for level in &update.asks {
            Self::apply_level(&mut self.asks, level);
        }
    }

    fn apply_level(side: &mut BTreeMap<Decimal, Decimal>, level: &BookLevel) {
        if level.size.is_zero() {
            side.remove(&level.price);
        } else {
            side.insert(level.price, level.size);
        }
    }

    /// Highest resting bid.
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(price, size)| BookLevel { price: *price, size: *size })
    }

    /// Lowest resting ask.
    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks
            .iter()
            .next()
            .map(|(price, size)| BookLevel { price: *price, size: *size })
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Bids from best to worst.
    pub fn bids(&self) -> impl Iterator<Item = BookLevel> + '_ {
        self.bids.iter().rev().map(|(price, size)| BookLevel { price: *price, size: *size })
    }

    /// Asks from best to worst.
    pub fn asks(&self) -> impl Iterator<Item = BookLevel> + '_ {
        self.asks.iter().map(|(price, size)| BookLevel { price: *price, size: *size })
    }

    /// A crossed book (bid at or above ask) means the feed is inconsistent.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
