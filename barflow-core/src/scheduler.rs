//! Scheduler queue — timed callbacks ordered by `(when, seq)`.
//!
//! `seq` is a per-queue monotonic counter, so two callbacks scheduled for
//! the same instant always fire in scheduling order. The queue itself is
//! clock-agnostic; the dispatchers decide whether scheduling in the past is
//! an error (backtesting) or coerced to "immediately" (realtime).

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use thiserror::Error;

use crate::handler::TimerHandler;

/// Scheduling before the current virtual clock in backtesting.
#[derive(Debug, Error)]
#[error("cannot schedule a callback at {when}: the clock is already at {now}")]
pub struct PastScheduleError {
    pub when: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

struct Entry {
    when: DateTime<Utc>,
    seq: u64,
    handler: Arc<dyn TimerHandler>,
}

// BinaryHeap is a max-heap; reverse the comparison to pop earliest first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.when.cmp(&self.when).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Min-heap of `(when, seq, handler)` triples.
#[derive(Default)]
pub struct SchedulerQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl SchedulerQueue {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), next_seq: 0 }
    }

    /// Queue a callback for `when`. Validity of `when` against the clock is
    /// the caller's concern.
    pub fn schedule(&mut self, when: DateTime<Utc>, handler: Arc<dyn TimerHandler>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { when, seq, handler });
    }

    /// Earliest scheduled instant, if any.
    pub fn peek_when(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|entry| entry.when)
    }

    /// Remove and return every callback due at or before `now`, in
    /// `(when, seq)` order.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, Arc<dyn TimerHandler>)> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.when > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry must pop");
            due.push((entry.when, entry.handler));
        }
        due
    }

    /// Drop every pending callback. Used on realtime shutdown.
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
