#![forbid(unsafe_code)]

use tokio::sync::broadcast;

use crate::Event;

/// Fan-out channel carrying transmuxer events to any number of listeners.
///
/// Every component holds a clone of the bus and fires events as it works;
/// nothing ever waits on delivery. Publishing is synchronous and
/// non-blocking, so it is just as usable from a blocking decryption task
/// as from async code. Events fired while nobody is subscribed simply
/// vanish.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose channel retains up to `capacity` undelivered
    /// events per subscriber.
    ///
    /// The capacity bounds how far behind a slow subscriber may fall
    /// before it starts missing events (see [`subscribe`](Self::subscribe)).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire an event at every current subscriber.
    ///
    /// Takes anything convertible into [`Event`], so sub-enum values like
    /// `TransmuxEvent::Error { .. }` can be passed directly.
    pub fn publish<E: Into<Event>>(&self, event: E) {
        // send only fails when no receiver exists, which is fine
        self.tx.send(event.into()).ok();
    }

    /// Open an independent receiver for everything published from now on.
    ///
    /// A receiver that falls more than the channel capacity behind gets
    /// `RecvError::Lagged(n)` and skips ahead instead of stalling the
    /// producers.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(32)
    }
}
