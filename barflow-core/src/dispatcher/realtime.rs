//! Realtime dispatcher — wall clock, sleeping loop, concurrent producers.
//!
//! The subscription contract is identical to backtesting; only the clock
//! differs. Producers run as their own tokio tasks and push into source
//! buffers; the loop drains whatever is due, then sleeps until the next
//! deadline or at most one poll interval.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::mux::MuxPoll;
use crate::source::Producer;

use super::{
    dispatch_event, dispatch_timers, shutdown, start_new_producers, ClockMode, DispatcherError,
    DispatcherHandle, Step,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wall-clock dispatcher for live sessions.
pub struct RealtimeDispatcher {
    handle: DispatcherHandle,
    strict: bool,
    poll_interval: Duration,
}

impl RealtimeDispatcher {
    pub fn new() -> Self {
        Self {
            handle: DispatcherHandle::new(ClockMode::Realtime),
            strict: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Upper bound on how long the loop sleeps when nothing is due.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Treat the first handler error as fatal instead of logging it and
    /// continuing.
    pub fn with_strict_handler_errors(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Run until `stop()`. On stop, the in-flight handler finishes, pending
    /// callbacks are dropped, remaining events are not drained, and every
    /// started producer receives `stop()`.
    pub async fn run(&self) -> Result<(), DispatcherError> {
        let mut started: Vec<Arc<dyn Producer>> = Vec::new();
        let result = self.run_loop(&mut started).await;
        self.handle.lock().scheduler.clear();
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

            start_new_producers(&self.handle, started).await;

            match self.next_step()? {
                Step::Timers(timers) => dispatch_timers(timers, self.strict).await?,
                Step::Deliver { event, handlers } => {
                    dispatch_event(event, handlers, self.strict).await?
                }
                Step::Retry => continue,
                Step::Finished => {
                    // Nothing due: sleep until the next deadline, a stop, or
                    // one poll interval, whichever comes first.
                    let sleep_for = self.time_until_next_deadline();
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = self.handle.stop.wait() => {}
                    }
                }
            }
        }
    }

    /// Resolve the next due step under the lock. Scheduler wins ties, as in
    /// backtesting; anything not yet due leaves the loop to sleep.
    fn next_step(&self) -> Result<Step, DispatcherError> {
        let now = Utc::now();
        let mut state = self.handle.lock();

        let t_sch = state.scheduler.peek_when();
        let ready = match state.mux.poll() {
            MuxPoll::Ready { source, when } => Some((source, when)),
            MuxPoll::Idle | MuxPoll::Exhausted => None,
        };

        let scheduler_due = t_sch.map_or(false, |when| when <= now);

        if scheduler_due {
            let scheduler_first = match (t_sch, ready) {
                (Some(t_sch), Some((_, when))) => t_sch <= when,
                _ => true,
            };
            if scheduler_first {
                // Callbacks at T run before the event at T, and never past
                // an earlier pending event.
                let bound = match ready {
                    Some((_, when)) => now.min(when),
                    None => now,
                };
                return Ok(Step::Timers(state.scheduler.pop_due(bound)));
            }
        }

        if let Some((source, when)) = ready {
            if when <= now {
                let event = match state.mux.pop(source) {
                    Some(event) => event,
                    None => return Ok(Step::Retry),
                };
                let handlers = state.subscriptions.handlers_for(event.kind(), source);
                return Ok(Step::Deliver { event, handlers });
            }
        }

        Ok(Step::Finished)
    }

    fn time_until_next_deadline(&self) -> Duration {
        let now = Utc::now();
        let mut state = self.handle.lock();

        let mut deadline: Option<chrono::DateTime<Utc>> = state.scheduler.peek_when();
        if let MuxPoll::Ready { when, .. } = state.mux.poll() {
            deadline = Some(deadline.map_or(when, |d| d.min(when)));
        }

        match deadline {
            Some(deadline) if deadline > now => (deadline - now)
                .to_std()
                .unwrap_or(self.poll_interval)
                .min(self.poll_interval),
            Some(_) => Duration::ZERO,
            None => self.poll_interval,
        }
    }
}

impl Default for RealtimeDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
