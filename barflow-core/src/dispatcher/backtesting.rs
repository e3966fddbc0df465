//! Backtesting dispatcher — virtual clock driven by the events themselves.
//!
//! The run loop repeatedly picks the earlier of the next scheduled callback
//! and the next source event, advances the virtual clock to it, and runs it
//! to completion. The scheduler wins ties so a strategy can react at `T`
//! before the event stamped `T` arrives. Handlers observe a stopped clock
//! for their entire duration.

use std::sync::Arc;

use crate::mux::MuxPoll;
use crate::source::Producer;

use super::{
    dispatch_event, dispatch_timers, shutdown, start_new_producers, ClockMode, DispatcherError,
    DispatcherHandle, Step,
};

/// Deterministic, single-task dispatcher over historical sources.
pub struct BacktestingDispatcher {
    handle: DispatcherHandle,
    strict: bool,
}

impl BacktestingDispatcher {
    pub fn new() -> Self {
        Self { handle: DispatcherHandle::new(ClockMode::Backtesting), strict: false }
    }

    /// Treat the first handler error as fatal instead of logging it and
    /// continuing.
    pub fn with_strict_handler_errors(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Handle for registering sources, subscriptions, and schedules.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Drive every source to exhaustion. Returns early on `stop()` or a
    /// fatal invariant violation; producers and stop hooks run on every
    /// exit path.
    pub async fn run(&self) -> Result<(), DispatcherError> {
        let mut started: Vec<Arc<dyn Producer>> = Vec::new();
        let result = self.run_loop(&mut started).await;
        shutdown(&self.handle, &started).await;
        result
    }

    async fn run_loop(
        &self,
        started: &mut Vec<Arc<dyn Producer>>,
    ) -> Result<(), DispatcherError> {
        loop {
            if self.handle.stop.triggered() {
                return Ok(());
            }

            let had_new = {
                let before = started.len();
                start_new_producers(&self.handle, started).await;
                started.len() > before
            };
            if had_new {
                // Give fresh producer tasks one chance to buffer before the
                // idle check can declare the run exhausted.
                tokio::task::yield_now().await;
            }

            match self.next_step()? {
                Step::Timers(timers) => dispatch_timers(timers, self.strict).await?,
                Step::Deliver { event, handlers } => {
                    dispatch_event(event, handlers, self.strict).await?
                }
                Step::Retry => continue,
                Step::Finished => return Ok(()),
            }
        }
    }

    /// Resolve the next step under the state lock. The clock advance and
    /// the pop happen atomically so no handler observes a half-step.
    fn next_step(&self) -> Result<Step, DispatcherError> {
        enum Choice {
            Timer(chrono::DateTime<chrono::Utc>),
            Event(crate::source::SourceId, chrono::DateTime<chrono::Utc>),
        }

        let mut state = self.handle.lock();
        let t_sch = state.scheduler.peek_when();
        let poll = state.mux.poll();

        let choice = match (t_sch, poll) {
            // Idle means no source can deliver and, in backtesting, nothing
            // new is coming beyond what producers already buffered.
            (None, MuxPoll::Exhausted) | (None, MuxPoll::Idle) => return Ok(Step::Finished),
            (Some(when), MuxPoll::Exhausted) | (Some(when), MuxPoll::Idle) => Choice::Timer(when),
            (None, MuxPoll::Ready { source, when }) => Choice::Event(source, when),
            (Some(t_sch), MuxPoll::Ready { source, when }) => {
                // Scheduler wins ties: callbacks at T fire before the event
                // stamped T.
                if t_sch <= when {
                    Choice::Timer(t_sch)
                } else {
                    Choice::Event(source, when)
                }
            }
        };

        match choice {
            Choice::Timer(when) => {
                // Past schedules are rejected at schedule(); the clock only
                // moves forward here.
                state.virtual_now = Some(when);
                Ok(Step::Timers(state.scheduler.pop_due(when)))
            }
            Choice::Event(source, _when) => {
                let event = match state.mux.pop(source) {
                    Some(event) => event,
                    None => return Ok(Step::Retry),
                };
                // The peek is only a selection hint; the popped event is
                // what the contract binds.
                if let Some(now) = state.virtual_now {
                    if event.when < now {
                        return Err(DispatcherError::NonMonotonicEvent {
                            source_id: source,
                            event: event.when,
                            now,
                        });
                    }
                }
                state.virtual_now = Some(event.when);
                let handlers = state.subscriptions.handlers_for(event.kind(), source);
                Ok(Step::Deliver { event, handlers })
            }
        }
    }
}

impl Default for BacktestingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind, EventPayload, OrderBookUpdate};
    use crate::handler::{handler_fn, timer_fn};
    use crate::pair::Pair;
    use crate::source::InMemorySource;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    fn event_at(minute: u32) -> Event {
        Event::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            EventPayload::OrderBook(OrderBookUpdate {
                pair: Pair::new("BTC", "USDT"),
                bids: vec![],
                asks: vec![],
            }),
        )
    }

    #[tokio::test]
    async fn delivers_in_chronological_order_across_sources() {
        let dispatcher = BacktestingDispatcher::new();
        let handle = dispatcher.handle();

        handle.add_event_source(Box::new(InMemorySource::new(vec![
            event_at(1),
            event_at(4),
        ])));
        handle.add_event_source(Box::new(InMemorySource::new(vec![
            event_at(2),
            event_at(3),
        ])));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handle.subscribe(
            EventKind::OrderBook,
            handler_fn(move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event.when);
                    Ok(())
                }
            }),
        );

        dispatcher.run().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn virtual_clock_tracks_dispatched_events() {
        let dispatcher = BacktestingDispatcher::new();
        let handle = dispatcher.handle();
        assert_eq!(handle.now(), None);

        handle.add_event_source(Box::new(InMemorySource::new(vec![event_at(7)])));
        dispatcher.run().await.unwrap();

        assert_eq!(handle.now(), Some(event_at(7).when));
    }

    #[tokio::test]
    async fn scheduling_in_the_past_fails() {
        let dispatcher = BacktestingDispatcher::new();
        let handle = dispatcher.handle();
        handle.add_event_source(Box::new(InMemorySource::new(vec![event_at(10)])));
        dispatcher.run().await.unwrap();

        let err = handle.schedule(event_at(5).when, timer_fn(|_| async { Ok(()) }));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn strict_mode_fails_on_handler_error() {
        let dispatcher = BacktestingDispatcher::new().with_strict_handler_errors(true);
        let handle = dispatcher.handle();
        handle.add_event_source(Box::new(InMemorySource::new(vec![event_at(1)])));
        handle.subscribe(
            EventKind::OrderBook,
            handler_fn(|_| async { Err("boom".into()) }),
        );

        assert!(matches!(
            dispatcher.run().await,
            Err(DispatcherError::HandlerFailed(_))
        ));
    }

    #[tokio::test]
    async fn lenient_mode_suppresses_handler_errors() {
        let dispatcher = BacktestingDispatcher::new();
        let handle = dispatcher.handle();
        handle.add_event_source(Box::new(InMemorySource::new(vec![
            event_at(1),
            event_at(2),
        ])));

        let seen = Arc::new(Mutex::new(0u32));
        let sink = seen.clone();
        handle.subscribe(
            EventKind::OrderBook,
            handler_fn(move |_| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() += 1;
                    Err("boom".into())
                }
            }),
        );

        dispatcher.run().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn stop_prevents_further_dispatch() {
        let dispatcher = BacktestingDispatcher::new();
        let handle = dispatcher.handle();
        handle.add_event_source(Box::new(InMemorySource::new(vec![
            event_at(1),
            event_at(2),
            event_at(3),
        ])));

        let seen = Arc::new(Mutex::new(0u32));
        let sink = seen.clone();
        let stopper = handle.clone();
        handle.subscribe(
            EventKind::OrderBook,
            handler_fn(move |_| {
                let sink = sink.clone();
                let stopper = stopper.clone();
                async move {
                    *sink.lock().unwrap() += 1;
                    stopper.stop();
                    Ok(())
                }
            }),
        );

        dispatcher.run().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn non_monotonic_source_is_fatal() {
        struct BrokenSource {
            events: Vec<Event>,
        }

        impl crate::source::EventSource for BrokenSource {
            fn peek_when(&mut self) -> Option<chrono::DateTime<Utc>> {
                // Lie about the next event so the merge accepts it, then
                // hand back an earlier one.
                self.events.first().map(|_| event_at(30).when)
            }

            fn pop(&mut self) -> Option<Event> {
                self.events.pop()
            }

            fn is_terminated(&self) -> bool {
                self.events.is_empty()
            }
        }

        let dispatcher = BacktestingDispatcher::new();
        let handle = dispatcher.handle();
        handle.add_event_source(Box::new(InMemorySource::new(vec![event_at(20)])));
        handle.add_event_source(Box::new(BrokenSource { events: vec![event_at(5)] }));

        assert!(matches!(
            dispatcher.run().await,
            Err(DispatcherError::NonMonotonicEvent { .. })
        ));
    }
}
