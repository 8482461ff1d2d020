//! Channel-based event delivery

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::trace;

use crate::event::ReaderEvent;

/// Sender for reader events
pub type ReaderEventSender = Sender<ReaderEvent>;
/// Receiver for reader events
pub type ReaderEventReceiver = Receiver<ReaderEvent>;

/// Create an unbounded channel for reader events
pub fn reader_event_channel() -> (ReaderEventSender, ReaderEventReceiver) {
    unbounded()
}

/// Create a bounded channel with the specified capacity for reader events
pub fn bounded_reader_event_channel(capacity: usize) -> (ReaderEventSender, ReaderEventReceiver) {
    bounded(capacity)
}

/// Fan-out of reader events to any number of subscribers
///
/// Publishing never blocks: a subscriber whose bounded channel is full misses the event,
/// and one whose receiver was dropped is forgotten.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<ReaderEventSender>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber
    pub fn subscribe(&self, sender: ReaderEventSender) {
        self.subscribers.lock().push(sender);
    }

    /// Add a subscriber on a fresh unbounded channel
    pub fn subscribe_unbounded(&self) -> ReaderEventReceiver {
        let (tx, rx) = reader_event_channel();
        self.subscribe(tx);
        rx
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every subscriber
    pub fn publish(&self, event: ReaderEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                trace!(?event, "subscriber queue full, event dropped");
                true
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe_unbounded();
        let b = bus.subscribe_unbounded();

        bus.publish(ReaderEvent::CardInserted { reader: 0 });

        assert_eq!(a.try_recv(), Ok(ReaderEvent::CardInserted { reader: 0 }));
        assert_eq!(b.try_recv(), Ok(ReaderEvent::CardInserted { reader: 0 }));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe_unbounded();
        drop(bus.subscribe_unbounded());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(ReaderEvent::CardRemoved { reader: 1 });
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }

    #[test]
    fn test_full_subscriber_is_kept() {
        let bus = EventBus::new();
        let (tx, rx) = bounded_reader_event_channel(1);
        bus.subscribe(tx);

        bus.publish(ReaderEvent::CardInserted { reader: 0 });
        bus.publish(ReaderEvent::CardRemoved { reader: 0 });

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(rx.try_recv(), Ok(ReaderEvent::CardInserted { reader: 0 }));
        assert!(rx.try_recv().is_err());
    }
}
