//! Event bus between producer threads and the dispatch loop.
//!
//! `EventPublisher::put` never blocks and may be called from any thread,
//! including the kernel event source's OS thread. `EventBus::get` never
//! blocks either; an empty queue is reported as `BusError::Empty`, distinct
//! from `BusError::Closed`. Readiness is exposed through `EventBus::ready`,
//! which the dispatch loop awaits alongside shutdown.
//!
//! Events from one producer are delivered in the order they were put.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

use routekeeper_events::Event;

/// Event bus errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// No event is queued right now.
    #[error("event bus is empty")]
    Empty,

    /// Every publisher, or the bus itself, is gone.
    #[error("event bus is closed")]
    Closed,
}

/// Create a connected publisher and bus.
pub fn channel() -> (EventPublisher, EventBus) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventPublisher { tx }, EventBus { rx, peeked: None })
}

/// Producer side of the bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventPublisher {
    /// Queue an event.
    pub fn put(&self, event: Event) -> Result<(), BusError> {
        self.tx.send(event).map_err(|_| BusError::Closed)
    }

    /// Returns true once the bus has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the bus.
#[derive(Debug)]
pub struct EventBus {
    rx: mpsc::UnboundedReceiver<Event>,
    peeked: Option<Event>,
}

impl EventBus {
    /// Take the next queued event without blocking.
    pub fn get(&mut self) -> Result<Event, BusError> {
        if let Some(event) = self.peeked.take() {
            return Ok(event);
        }
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => BusError::Empty,
            TryRecvError::Disconnected => BusError::Closed,
        })
    }

    /// Wait until an event is available.
    ///
    /// Returns `BusError::Closed` once every publisher is gone and the queue
    /// is drained. The event stays queued for the next `get` or `drain`.
    pub async fn ready(&mut self) -> Result<(), BusError> {
        if self.peeked.is_some() {
            return Ok(());
        }
        match self.rx.recv().await {
            Some(event) => {
                self.peeked = Some(event);
                Ok(())
            }
            None => Err(BusError::Closed),
        }
    }

    /// Take every event queued right now.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.get() {
            events.push(event);
        }
        events
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.rx.len() + usize::from(self.peeked.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting events. Queued events can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
