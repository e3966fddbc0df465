//! Event multiplexer — chronological merge of registered sources.
//!
//! Selection always picks the source whose next event carries the earliest
//! `when`; ties go to the source registered first. The merge is lazy: the
//! multiplexer only ever looks one event ahead per source.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::event::Event;
use crate::source::{EventSource, Producer, SourceId};

/// Outcome of polling the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxPoll {
    /// A source has an event ready; `source` is the one to pop.
    Ready { source: SourceId, when: DateTime<Utc> },
    /// At least one source is alive but none has an event right now.
    Idle,
    /// Every source has terminated.
    Exhausted,
}

struct Slot {
    id: SourceId,
    source: Box<dyn EventSource>,
    producer_started: bool,
}

/// Merges a dynamic set of sources into one non-decreasing stream.
#[derive(Default)]
pub struct EventMultiplexer {
    slots: Vec<Slot>,
    next_id: u64,
}

impl EventMultiplexer {
    pub fn new() -> Self {
        Self { slots: Vec::new(), next_id: 0 }
    }

    /// Register a source. The returned id doubles as the FIFO tie-break:
    /// earlier registrations win simultaneous events.
    pub fn add_source(&mut self, source: Box<dyn EventSource>) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        self.slots.push(Slot { id, source, producer_started: false });
        id
    }

    /// Pick the source with the earliest next event. Terminated sources are
    /// dropped as a side effect.
    pub fn poll(&mut self) -> MuxPoll {
        self.slots.retain(|slot| !slot.source.is_terminated());
        if self.slots.is_empty() {
            return MuxPoll::Exhausted;
        }

        let mut best: Option<(DateTime<Utc>, SourceId)> = None;
        for slot in &mut self.slots {
            if let Some(when) = slot.source.peek_when() {
                // Strictly-less keeps the first-registered source on ties.
                let better = best.map_or(true, |(best_when, _)| when < best_when);
                if better {
                    best = Some((when, slot.id));
                }
            }
        }

        match best {
            Some((when, source)) => MuxPoll::Ready { source, when },
            None => MuxPoll::Idle,
        }
    }

    /// Pop the next event from the given source.
    pub fn pop(&mut self, id: SourceId) -> Option<Event> {
        self.slots.iter_mut().find(|slot| slot.id == id)?.source.pop()
    }

    /// Producers attached to sources that have not been started yet. Marks
    /// them started; the caller owns the actual lifecycle calls.
    pub fn take_unstarted_producers(&mut self) -> Vec<Arc<dyn Producer>> {
        let mut producers = Vec::new();
        for slot in &mut self.slots {
            if !slot.producer_started {
                slot.producer_started = true;
                if let Some(producer) = slot.source.producer() {
                    producers.push(producer);
                }
            }
        }
        producers
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, OrderBookUpdate};
    use crate::pair::Pair;
    use crate::source::InMemorySource;
    use chrono::TimeZone;

    fn event_at(minute: u32, pair: &str) -> Event {
        Event::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            EventPayload::OrderBook(OrderBookUpdate {
                pair: Pair::new(pair, "USDT"),
                bids: vec![],
                asks: vec![],
            }),
        )
    }

    #[test]
    fn earliest_source_wins() {
        let mut mux = EventMultiplexer::new();
        mux.add_source(Box::new(InMemorySource::new(vec![event_at(5, "A")])));
        let late = mux.add_source(Box::new(InMemorySource::new(vec![event_at(2, "B")])));

        match mux.poll() {
            MuxPoll::Ready { source, when } => {
                assert_eq!(source, late);
                assert_eq!(when, event_at(2, "B").when);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn ties_go_to_the_source_registered_first() {
        let mut mux = EventMultiplexer::new();
        let first = mux.add_source(Box::new(InMemorySource::new(vec![event_at(3, "A")])));
        let _second = mux.add_source(Box::new(InMemorySource::new(vec![event_at(3, "B")])));

        match mux.poll() {
            MuxPoll::Ready { source, .. } => assert_eq!(source, first),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn merge_is_globally_chronological() {
        let mut mux = EventMultiplexer::new();
        mux.add_source(Box::new(InMemorySource::new(vec![
            event_at(1, "A"),
            event_at(4, "A"),
        ])));
        mux.add_source(Box::new(InMemorySource::new(vec![
            event_at(2, "B"),
            event_at(3, "B"),
        ])));

        let mut whens = Vec::new();
        while let MuxPoll::Ready { source, .. } = mux.poll() {
            whens.push(mux.pop(source).unwrap().when);
        }
        let minutes: Vec<_> = whens.iter().map(|w| w.timestamp() / 60 % 60).collect();
        assert_eq!(minutes, vec![1, 2, 3, 4]);
        assert_eq!(mux.poll(), MuxPoll::Exhausted);
    }

    #[test]
    fn empty_multiplexer_is_exhausted() {
        let mut mux = EventMultiplexer::new();
        assert_eq!(mux.poll(), MuxPoll::Exhausted);
    }

    #[test]
    fn exhausted_only_after_every_source_terminates() {
        let mut mux = EventMultiplexer::new();
        let a = mux.add_source(Box::new(InMemorySource::new(vec![event_at(1, "A")])));
        mux.add_source(Box::new(InMemorySource::new(vec![event_at(2, "B")])));

        assert!(matches!(mux.poll(), MuxPoll::Ready { source, .. } if source == a));
        mux.pop(a);
        assert!(matches!(mux.poll(), MuxPoll::Ready { .. }));
    }
}
