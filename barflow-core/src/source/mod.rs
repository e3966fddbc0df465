//! Event sources — lazy, ordered producers of events.
//!
//! A source hands the multiplexer one event at a time through peek/pop
//! semantics. Two consecutive pops from the same source never go backwards
//! in time. A source may be fed by a background [`Producer`] task; the
//! dispatcher starts producers when the run loop starts and stops them on
//! every exit path.

pub mod csv;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::event::Event;

pub use self::csv::CsvBarSource;

/// Identifier assigned when a source is registered with a dispatcher.
/// Registration order is the tie-break for simultaneous events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// A lazy, ordered producer of events.
pub trait EventSource: Send {
    /// Earliest `when` this source can deliver right now. `None` means the
    /// source is transiently empty or has terminated.
    fn peek_when(&mut self) -> Option<DateTime<Utc>>;

    /// Remove and return the event reported by `peek_when`.
    fn pop(&mut self) -> Option<Event>;

    /// Whether the source will never produce again.
    fn is_terminated(&self) -> bool;

    /// Background task feeding this source, if any.
    fn producer(&self) -> Option<Arc<dyn Producer>> {
        None
    }
}

/// Background task that populates a source's buffer.
///
/// Both hooks are idempotent. Once `start` has succeeded, the dispatcher
/// guarantees `stop` runs on every exit path.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
}

/// Fixed buffer of events, sorted at construction. Useful for replays and
/// test fixtures.
pub struct InMemorySource {
    buffer: VecDeque<Event>,
}

impl InMemorySource {
    pub fn new(mut events: Vec<Event>) -> Self {
        events.sort_by_key(|event| event.when);
        Self { buffer: events.into() }
    }

    pub fn empty() -> Self {
        Self { buffer: VecDeque::new() }
    }

    /// Append an event. Must not predate the current tail.
    pub fn push(&mut self, event: Event) {
        debug_assert!(
            self.buffer.back().map_or(true, |tail| tail.when <= event.when),
            "events must be pushed in chronological order"
        );
        self.buffer.push_back(event);
    }
}

impl EventSource for InMemorySource {
    fn peek_when(&mut self) -> Option<DateTime<Utc>> {
        self.buffer.front().map(|event| event.when)
    }

    fn pop(&mut self) -> Option<Event> {
        self.buffer.pop_front()
    }

    fn is_terminated(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Sending half handed to a producer task. Dropping every clone terminates
/// the source once its buffer drains.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Push an event into the source buffer, waiting for capacity.
    /// Returns false if the source side is gone.
    pub async fn push(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Source fed by a bounded channel from a producer task. The buffer is
/// drained non-blockingly on every peek, so `peek_when` always reflects the
/// earliest event buffered at observation time.
pub struct ChannelSource {
    rx: mpsc::Receiver<Event>,
    buffer: VecDeque<Event>,
    producer: Option<Arc<dyn Producer>>,
    closed: bool,
}

impl ChannelSource {
    /// Create a source and the sink its producer pushes into.
    pub fn new(capacity: usize) -> (Self, EventSink) {
        let (tx, rx) = mpsc::channel(capacity);
        let source = Self { rx, buffer: VecDeque::new(), producer: None, closed: false };
        (source, EventSink { tx })
    }

    /// Attach the producer that owns the feeding task.
    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.buffer.push_back(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

impl EventSource for ChannelSource {
    fn peek_when(&mut self) -> Option<DateTime<Utc>> {
        self.drain();
        self.buffer.front().map(|event| event.when)
    }

    fn pop(&mut self) -> Option<Event> {
        self.drain();
        self.buffer.pop_front()
    }

    fn is_terminated(&self) -> bool {
        self.closed && self.buffer.is_empty()
    }

    fn producer(&self) -> Option<Arc<dyn Producer>> {
        self.producer.clone()
    }
}
