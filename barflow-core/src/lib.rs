//! barflow core — event primitives and the time-ordered dispatchers.
//!
//! Provides timestamped events, lazy event sources with optional background
//! producers, a scheduler queue for timed callbacks, the multiplexer that
//! merges sources into one chronological stream, and the two dispatcher
//! variants (backtesting with a virtual clock, realtime with the wall clock)
//! that drive it all.

pub mod book;
pub mod dispatcher;
pub mod event;
pub mod handler;
pub mod mux;
pub mod pair;
pub mod scheduler;
pub mod source;

pub use book::OrderBook;
pub use dispatcher::{
    BacktestingDispatcher, DispatcherError, DispatcherHandle, RealtimeDispatcher, StopHandler,
};
pub use event::{Bar, BarError, BarEvent, BookLevel, Event, EventKind, EventPayload, OrderBookUpdate};
pub use handler::{handler_fn, timer_fn, EventHandler, HandlerError, TimerHandler};
pub use mux::{EventMultiplexer, MuxPoll};
pub use pair::{round_fee_up, round_price, truncate_amount, Pair, PairInfo};
pub use scheduler::{PastScheduleError, SchedulerQueue};
pub use source::{
    ChannelSource, CsvBarSource, EventSink, EventSource, InMemorySource, Producer, SourceId,
};
