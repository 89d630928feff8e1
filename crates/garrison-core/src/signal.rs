//! Lifecycle signals and store watchers.
//!
//! Facades and the client publish typed signals. Handlers run inline on
//! the emitting task so that, for example, `StateChanged` is observed
//! before the triggering method returns; handlers must therefore be
//! non-blocking and must not panic back into the emitter.
//!
//! Watchers are restartable async sequences: a subscription yields the
//! current snapshot first, then one item per mutation.

use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Inline fan-out of typed signals to registered handlers.
pub struct SignalHub<T> {
    handlers: Mutex<Vec<Box<dyn Fn(&T) + Send + Sync>>>,
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T: Clone> SignalHub<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register an inline handler. Called synchronously on every emit.
    pub fn on(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.handlers.lock().unwrap().push(Box::new(handler));
    }

    /// Subscribe as an async stream of signals.
    pub fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver a signal to every handler and live subscriber.
    pub fn emit(&self, signal: T) {
        for handler in self.handlers.lock().unwrap().iter() {
            handler(&signal);
        }
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(signal.clone()).is_ok());
    }
}

impl<T: Clone> Default for SignalHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot-then-stream watcher over a mutable list.
///
/// `watch()` returns the current value immediately followed by a receiver
/// that yields the new value after each mutation.
pub struct Watch<T> {
    current: Mutex<T>,
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T: Clone> Watch<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> T {
        self.current.lock().unwrap().clone()
    }

    /// Replace the value and notify all live watchers.
    pub fn set(&self, value: T) {
        *self.current.lock().unwrap() = value.clone();
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Snapshot plus a stream of future values.
    pub fn watch(&self) -> (T, UnboundedReceiver<T>) {
        // Take the snapshot under the same lock that `set` uses for the
        // current value, so a watcher never misses a mutation between
        // snapshot and subscription.
        let current = self.current.lock().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        (current.clone(), rx)
    }
}
