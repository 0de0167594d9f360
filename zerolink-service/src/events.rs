//! The event bus: a queue of owned event messages drained by one
//! dedicated thread into the user's handler.
//!
//! Producers enqueue by move and never block; when the queue is full the
//! message is dropped and counted. The drain thread ticks every 25 ms,
//! dispatches a bounded batch per tick, and exits only once the service
//! has stopped *and* the queue is empty, so no accepted event is lost on
//! shutdown. The handler is never re-entered concurrently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{trace, warn};

use zerolink_core::{Event, EventMessage};

/// Drain cadence.
const TICK: Duration = Duration::from_millis(25);
/// Messages dispatched per tick at most.
const BATCH: usize = 32;

/// Receives every event message exactly once, in per-producer order.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, msg: &EventMessage);
}

impl<F: Fn(&EventMessage) + Send + Sync> EventHandler for F {
    fn on_event(&self, msg: &EventMessage) {
        self(msg)
    }
}

/// The bus. Clone-free: owners share it behind an `Arc`.
pub struct EventBus {
    tx: Sender<EventMessage>,
    rx: Receiver<EventMessage>,
    /// The user handler. Swapping it never tears down a dispatch in
    /// flight: the drain thread pins the current handler for the length
    /// of one callback.
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    running: AtomicBool,
    dropped: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create the bus and start its drain thread.
    pub fn start(capacity: usize, handler: Option<Arc<dyn EventHandler>>) -> Arc<Self> {
        let (tx, rx) = bounded(capacity.max(16));
        let bus = Arc::new(Self {
            tx,
            rx,
            handler: Mutex::new(handler),
            running: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
            thread: Mutex::new(None),
        });
        let worker = bus.clone();
        let handle = std::thread::Builder::new()
            .name("zerolink-events".into())
            .spawn(move || worker.drain_loop())
            .ok();
        *bus.thread.lock() = handle;
        bus
    }

    /// Replace the user handler.
    pub fn set_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        *self.handler.lock() = handler;
    }

    /// Enqueue a message; drops (and counts) when the queue is full or
    /// the bus has been stopped.
    pub fn post(&self, msg: EventMessage) {
        if !self.running.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(m)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = ?m.event, "event queue full, message dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Enqueue a bare event with no payload.
    pub fn post_code(&self, event: Event) {
        self.post(EventMessage::bare(event));
    }

    /// Messages dropped due to back-pressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting messages and join the drain thread once the queue
    /// has emptied.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn drain_loop(&self) {
        loop {
            let mut dispatched = 0;
            while dispatched < BATCH {
                match self.rx.try_recv() {
                    Ok(msg) => {
                        trace!(event = ?msg.event, "dispatching event");
                        let handler = self.handler.lock().clone();
                        if let Some(h) = handler.as_ref() {
                            h.on_event(&msg);
                        }
                        dispatched += 1;
                    }
                    Err(_) => break,
                }
            }
            if !self.running.load(Ordering::Acquire) && self.rx.is_empty() {
                break;
            }
            std::thread::sleep(TICK);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct Collect(PlMutex<Vec<Event>>);
    impl EventHandler for Collect {
        fn on_event(&self, msg: &EventMessage) {
            self.0.lock().push(msg.event);
        }
    }

    #[test]
    fn delivers_each_message_once_in_order() {
        let sink = Arc::new(Collect(PlMutex::new(Vec::new())));
        let bus = EventBus::start(64, Some(sink.clone()));
        bus.post_code(Event::NodeUp);
        bus.post_code(Event::NodeOnline);
        bus.post_code(Event::NetworkOk);
        bus.stop();
        assert_eq!(
            sink.0.lock().as_slice(),
            &[Event::NodeUp, Event::NodeOnline, Event::NetworkOk]
        );
    }

    #[test]
    fn stop_drains_pending_messages() {
        let sink = Arc::new(Collect(PlMutex::new(Vec::new())));
        let bus = EventBus::start(1024, Some(sink.clone()));
        for _ in 0..100 {
            bus.post_code(Event::PeerDirect);
        }
        bus.stop();
        assert_eq!(sink.0.lock().len(), 100);
        // Posts after stop are swallowed
        bus.post_code(Event::PeerRelay);
        assert_eq!(sink.0.lock().len(), 100);
        assert!(bus.dropped() >= 1);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        // No handler, tiny queue, thread stopped quickly so the queue
        // backs up
        let bus = EventBus::start(16, None);
        for _ in 0..200 {
            bus.post_code(Event::NodeUp);
        }
        assert!(bus.dropped() > 0);
        bus.stop();
    }
}
