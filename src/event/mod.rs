//! Event Bus - decouples lifecycle transitions from their side effects
//!
//! ## Rules
//! - Handlers run in subscription order, inside the emitter's own task.
//! - A failing or panicking handler is logged and skipped; the rest still run.
//! - Emitting an event from inside one of its own handlers is refused with
//!   [`EventError::Reentrant`]. Emitting *other* events from a handler is fine
//!   (the `Idle` handler closes the server, which emits `Closing` and `Closed`).
//! - Independent tasks may emit the same event at the same time.

pub mod history;
pub mod logger;

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::wait::Poller;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerEvent {
    /// startup has begun
    Opening,
    /// startup finished, the port is listening
    Opened,
    Closing,
    Closed,
    /// the port stopped listening while open
    Crashed,
    /// the port never opened within the startup timeout
    Hung,
    /// a client joined an empty server
    Occupied,
    /// the last client left
    Empty,
    /// empty for longer than the idle timeout
    Idle,
}

impl ServerEvent {
    pub const ALL: [ServerEvent; 9] = [
        ServerEvent::Opening,
        ServerEvent::Opened,
        ServerEvent::Closing,
        ServerEvent::Closed,
        ServerEvent::Crashed,
        ServerEvent::Hung,
        ServerEvent::Occupied,
        ServerEvent::Empty,
        ServerEvent::Idle,
    ];
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "OPENING",
            Self::Opened => "OPENED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Crashed => "CRASHED",
            Self::Hung => "HUNG",
            Self::Occupied => "OCCUPIED",
            Self::Empty => "EMPTY",
            Self::Idle => "IDLE",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event {0} was emitted while it was still being handled")]
    Reentrant(ServerEvent),
}

type Handler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // the guarded maps stay consistent even if a holder panicked
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

tokio::task_local! {
    /// Events whose handlers the current call chain is running, outermost first.
    static EMITTING: Vec<ServerEvent>;
}

/// Counts an in-flight emission until dropped.
struct Dispatching<'a> {
    in_flight: &'a Mutex<HashMap<ServerEvent, usize>>,
    event: ServerEvent,
}

impl<'a> Dispatching<'a> {
    fn enter(in_flight: &'a Mutex<HashMap<ServerEvent, usize>>, event: ServerEvent) -> Self {
        *lock(in_flight).entry(event).or_default() += 1;
        Self { in_flight, event }
    }
}

impl Drop for Dispatching<'_> {
    fn drop(&mut self) {
        let mut in_flight = lock(self.in_flight);
        if let Some(count) = in_flight.get_mut(&self.event) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.event);
            }
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<ServerEvent, Vec<Handler>>>,
    in_flight: Mutex<HashMap<ServerEvent, usize>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` to run every time `event` is emitted.
    pub fn subscribe<F, Fut>(&self, event: ServerEvent, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move || handler().boxed());
        lock(&self.handlers).entry(event).or_default().push(handler);
    }

    pub fn subscriber_count(&self, event: ServerEvent) -> usize {
        lock(&self.handlers).get(&event).map_or(0, Vec::len)
    }

    /// Whether any emission of `event` is currently running its handlers.
    pub fn is_dispatching(&self, event: ServerEvent) -> bool {
        lock(&self.in_flight).contains_key(&event)
    }

    /// Runs every handler subscribed to `event`, in order.
    pub async fn emit(&self, event: ServerEvent) -> Result<(), EventError> {
        let mut chain = EMITTING.try_with(|chain| chain.clone()).unwrap_or_default();
        if chain.contains(&event) {
            return Err(EventError::Reentrant(event));
        }
        chain.push(event);
        EMITTING.scope(chain, self.dispatch(event)).await;
        Ok(())
    }

    async fn dispatch(&self, event: ServerEvent) {
        let handlers = lock(&self.handlers).get(&event).cloned().unwrap_or_default();
        let _dispatching = Dispatching::enter(&self.in_flight, event);

        tracing::debug!(%event, handlers = handlers.len(), "Dispatching event");
        for (index, handler) in handlers.iter().enumerate() {
            match AssertUnwindSafe(handler()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(%event, index, "Handler for event {} failed: {:#}", event, e)
                }
                Err(_) => tracing::error!(%event, index, "Handler for event {} panicked", event),
            }
        }
    }

    /// Suspends until no emission of `event` is in flight.
    pub async fn wait(&self, event: ServerEvent) {
        // unbounded, so this cannot time out
        let _ = Poller::wait(|| !self.is_dispatching(event), None).await;
    }
}
