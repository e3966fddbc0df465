//! Dispatchers — the reactors that order and deliver events.
//!
//! Both variants share the subscription, scheduling, and lifecycle
//! contract; they differ only in their clock. The backtesting dispatcher
//! advances a virtual clock to each event, the realtime dispatcher follows
//! the wall clock and sleeps between deadlines.
//!
//! All dispatcher-driven work runs on one logical task. Handlers may
//! suspend internally, but the dispatcher never advances the clock or picks
//! another event while a handler is in flight.

mod backtesting;
mod realtime;

pub use backtesting::BacktestingDispatcher;
pub use realtime::RealtimeDispatcher;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::error;

use crate::event::{Event, EventKind};
use crate::handler::{EventHandler, TimerHandler};
use crate::mux::EventMultiplexer;
use crate::scheduler::{PastScheduleError, SchedulerQueue};
use crate::source::{EventSource, Producer, SourceId};

/// Errors that terminate a dispatcher run. These are invariant violations;
/// recoverable conditions never surface here.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("source {source_id:?} produced {event} after the clock reached {now}")]
    NonMonotonicEvent {
        source_id: SourceId,
        event: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("handler failed in strict mode: {0}")]
    HandlerFailed(String),
}

/// Hook invoked once after the run loop exits, on every exit path.
pub trait StopHandler: Send + Sync {
    fn on_stop(&self);
}

/// Cooperative stop signal shared between a dispatcher and its owner.
#[derive(Clone)]
pub(crate) struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        if self.triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Subscription table keyed by `(event kind, optional source)`. Delivery
/// merges source-specific and kind-wide subscribers in registration order.
#[derive(Default)]
struct SubscriptionTable {
    next_seq: u64,
    by_key: HashMap<(EventKind, Option<SourceId>), Vec<(u64, Arc<dyn EventHandler>)>>,
}

impl SubscriptionTable {
    fn subscribe(
        &mut self,
        kind: EventKind,
        source: Option<SourceId>,
        handler: Arc<dyn EventHandler>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_key.entry((kind, source)).or_default().push((seq, handler));
    }

    fn handlers_for(&self, kind: EventKind, source: SourceId) -> Vec<Arc<dyn EventHandler>> {
        let mut merged: Vec<(u64, Arc<dyn EventHandler>)> = Vec::new();
        if let Some(entries) = self.by_key.get(&(kind, Some(source))) {
            merged.extend(entries.iter().map(|(seq, h)| (*seq, h.clone())));
        }
        if let Some(entries) = self.by_key.get(&(kind, None)) {
            merged.extend(entries.iter().map(|(seq, h)| (*seq, h.clone())));
        }
        merged.sort_by_key(|(seq, _)| *seq);
        merged.into_iter().map(|(_, handler)| handler).collect()
    }
}

/// Mutable dispatcher state. Locked briefly per loop iteration; never held
/// across a handler await.
struct CoreState {
    mux: EventMultiplexer,
    scheduler: SchedulerQueue,
    subscriptions: SubscriptionTable,
    stop_handlers: Vec<Arc<dyn StopHandler>>,
    virtual_now: Option<DateTime<Utc>>,
}

impl CoreState {
    fn new() -> Self {
        Self {
            mux: EventMultiplexer::new(),
            scheduler: SchedulerQueue::new(),
            subscriptions: SubscriptionTable::default(),
            stop_handlers: Vec::new(),
            virtual_now: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ClockMode {
    Backtesting,
    Realtime,
}

/// Cloneable handle onto a dispatcher. Handlers receive one so they can add
/// sources, subscribe, and schedule mid-run; changes take effect on the
/// next loop iteration, never retroactively.
#[derive(Clone)]
pub struct DispatcherHandle {
    state: Arc<Mutex<CoreState>>,
    mode: ClockMode,
    stop: StopSignal,
}

impl DispatcherHandle {
    fn new(mode: ClockMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoreState::new())),
            mode,
            stop: StopSignal::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().expect("dispatcher state poisoned")
    }

    /// Register an event source. Earlier registrations win tie-breaks on
    /// simultaneous events.
    pub fn add_event_source(&self, source: Box<dyn EventSource>) -> SourceId {
        self.lock().mux.add_source(source)
    }

    /// Subscribe a handler to every event of `kind`.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.lock().subscriptions.subscribe(kind, None, handler);
    }

    /// Subscribe a handler to events of `kind` from one specific source.
    pub fn subscribe_to_source(
        &self,
        kind: EventKind,
        source: SourceId,
        handler: Arc<dyn EventHandler>,
    ) {
        self.lock().subscriptions.subscribe(kind, Some(source), handler);
    }

    /// Schedule a one-shot callback. In backtesting, scheduling before the
    /// virtual clock fails; in realtime a past instant is coerced to now.
    pub fn schedule(
        &self,
        when: DateTime<Utc>,
        handler: Arc<dyn TimerHandler>,
    ) -> Result<(), PastScheduleError> {
        match self.mode {
            ClockMode::Backtesting => {
                let mut state = self.lock();
                if let Some(now) = state.virtual_now {
                    if when < now {
                        return Err(PastScheduleError { when, now });
                    }
                }
                state.scheduler.schedule(when, handler);
                Ok(())
            }
            ClockMode::Realtime => {
                let effective = when.max(Utc::now());
                self.lock().scheduler.schedule(effective, handler);
                Ok(())
            }
        }
    }

    /// Register a hook that runs once after the run loop exits.
    pub fn add_stop_handler(&self, handler: Arc<dyn StopHandler>) {
        self.lock().stop_handlers.push(handler);
    }

    /// The dispatcher's current clock. `None` before the first backtesting
    /// event has been dispatched.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        match self.mode {
            ClockMode::Backtesting => self.lock().virtual_now,
            ClockMode::Realtime => Some(Utc::now()),
        }
    }

    /// Signal the run loop to exit. The in-flight handler finishes; nothing
    /// further is dispatched.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.triggered()
    }
}

/// One resolved step of a run loop.
enum Step {
    /// Due callbacks at a single instant, `(when, seq)` ordered.
    Timers(Vec<(DateTime<Utc>, Arc<dyn TimerHandler>)>),
    /// One event plus its subscriber snapshot.
    Deliver { event: Event, handlers: Vec<Arc<dyn EventHandler>> },
    /// A source raced its own peek; try another iteration.
    Retry,
    Finished,
}

/// Run a subscriber snapshot against one event. Failures are logged with
/// event context and suppressed unless `strict`.
async fn dispatch_event(
    event: Event,
    handlers: Vec<Arc<dyn EventHandler>>,
    strict: bool,
) -> Result<(), DispatcherError> {
    for handler in handlers {
        if let Err(err) = handler.on_event(event.clone()).await {
            error!(when = %event.when, kind = ?event.kind(), error = %err, "event handler failed");
            if strict {
                return Err(DispatcherError::HandlerFailed(err.to_string()));
            }
        }
    }
    Ok(())
}

/// Run due callbacks to completion, in order.
async fn dispatch_timers(
    timers: Vec<(DateTime<Utc>, Arc<dyn TimerHandler>)>,
    strict: bool,
) -> Result<(), DispatcherError> {
    for (when, handler) in timers {
        if let Err(err) = handler.on_timer(when).await {
            error!(when = %when, error = %err, "scheduled callback failed");
            if strict {
                return Err(DispatcherError::HandlerFailed(err.to_string()));
            }
        }
    }
    Ok(())
}

/// Start producers attached since the previous iteration, tracking them for
/// shutdown. Scoped acquisition: every producer started here is stopped on
/// every exit path.
async fn start_new_producers(handle: &DispatcherHandle, started: &mut Vec<Arc<dyn Producer>>) {
    let new = handle.lock().mux.take_unstarted_producers();
    for producer in new {
        producer.start().await;
        started.push(producer);
    }
}

/// Shared teardown: stop producers, then run stop hooks.
async fn shutdown(handle: &DispatcherHandle, started: &[Arc<dyn Producer>]) {
    for producer in started {
        producer.stop().await;
    }
    let hooks: Vec<_> = handle.lock().stop_handlers.clone();
    for hook in hooks {
        hook.on_stop();
    }
}
