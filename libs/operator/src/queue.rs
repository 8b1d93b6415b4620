//! Event Queue: an unbounded, thread-safe FIFO of events awaiting commit.
//! Producers are admission and watch ingestion; consumers are the
//! dispatcher that demultiplexes onto per-destination commit workers.
//!
//! Backed by `tokio::sync::mpsc`'s unbounded channel — message passing
//! over a shared mutable queue, parallel tasks rather than cooperative
//! single-threaded I/O.

use tokio::sync::mpsc;

use crate::event::Event;

/// Producer handle. Cheaply `Clone`-able; every admission/watch task
/// holds one.
#[derive(Clone)]
pub struct EventQueue {
    sender: mpsc::UnboundedSender<Event>,
}

/// Consumer handle held by the single dispatcher task. Not `Clone` — one
/// reader drains `F` and fans events out to per-destination workers.
pub struct EventQueueReceiver {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventQueue {
    pub fn new() -> (Self, EventQueueReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, EventQueueReceiver { receiver })
    }

    /// Enqueues an event. The only failure mode is "the dispatcher has
    /// shut down", which is not an error for the caller — the event is
    /// simply dropped the way an uncommitted flush is dropped at
    /// shutdown.
    pub fn push(&self, event: Event) -> bool {
        self.sender.send(event).is_ok()
    }
}

impl EventQueueReceiver {
    /// Returns `None` once every `EventQueue` producer handle has been
    /// dropped — the queue's close signal.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}
