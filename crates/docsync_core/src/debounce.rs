//! Debounce-with-ceiling trigger.
//!
//! [`Debouncer::ping`] marks the owner dirty. The action runs once the
//! pings have been quiet for `delay`, and never later than `max_delay`
//! after the first unflushed ping, so continuous churn still produces
//! one invocation per `max_delay` window.
//!
//! The same primitive gates per-document snapshots, fleet-wide storage
//! writes and cluster publish batches.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// Work performed when the debouncer fires.
pub type DebounceAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Cloneable handle to a debounced action.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

struct Inner {
    delay: Duration,
    max_delay: Duration,
    action: DebounceAction,
    runtime: Handle,
    /// Invocations never overlap.
    run_lock: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Time of the first ping since the last fire.
    dirty_since: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    /// Invalidates timers armed before the latest ping or fire.
    generation: u64,
    in_flight: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Debouncer {
    /// Create a debouncer bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(delay: Duration, max_delay: Duration, action: DebounceAction) -> Self {
        Self {
            inner: Arc::new(Inner {
                delay,
                max_delay,
                action,
                runtime: Handle::current(),
                run_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Mark dirty and (re)schedule the action. Ignored after [`flush`](Self::flush).
    pub fn ping(&self) {
        let mut state = self.inner.lock_state();
        if state.closed {
            return;
        }

        let now = Instant::now();
        let since = *state.dirty_since.get_or_insert(now);
        if now.duration_since(since) >= self.inner.max_delay {
            self.inner.fire(&mut state);
            return;
        }

        let deadline = (now + self.inner.delay).min(since + self.inner.max_delay);
        self.inner.arm(&mut state, deadline);
    }

    /// Fire right away if dirty, without waiting for the timer.
    pub fn trigger(&self) {
        let mut state = self.inner.lock_state();
        if state.dirty_since.is_some() {
            self.inner.fire(&mut state);
        }
    }

    /// Whether a ping is waiting to be acted on.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock_state().dirty_since.is_some()
    }

    /// Run a final invocation if dirty, wait for every invocation in
    /// flight, and reject further pings.
    pub async fn flush(&self) {
        let in_flight = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            if state.dirty_since.is_some() {
                self.inner.fire(&mut state);
            } else if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.in_flight)
        };

        for handle in in_flight {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("Debounced action panicked: {}", e);
                }
            }
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(self: &Arc<Self>, state: &mut State, deadline: Instant) {
        state.generation += 1;
        let generation = state.generation;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let inner = Arc::clone(self);
        state.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut state = inner.lock_state();
            if state.generation == generation && state.dirty_since.is_some() {
                state.timer = None;
                inner.fire(&mut state);
            }
        }));
    }

    fn fire(self: &Arc<Self>, state: &mut State) {
        state.dirty_since = None;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.in_flight.retain(|handle| !handle.is_finished());

        let inner = Arc::clone(self);
        state.in_flight.push(self.runtime.spawn(async move {
            let _running = inner.run_lock.lock().await;
            (inner.action)().await;
        }));
    }
}
