//! Queue notifications.
//!
//! The queue keeps one consumer-side [`BufferQueueListener`] and one producer-side
//! release listener, both as `Weak` references, so a dead listener never keeps the
//! queue alive and the queue never keeps a listener alive.
//! [`QueueEvent::BufferReleased`] goes to the release listener, every other event to
//! the consumer listener.
//! Callbacks always run after the queue lock has been released, on the thread that
//! caused the event. Implementations that need to do real work should hand the event
//! to their own thread; [`ChannelListener`] does exactly that.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use novade_buffer_manager::SequenceNumber;

/// Something that happened on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEvent {
    /// A buffer was flushed and can be acquired.
    BufferAvailable,
    /// The queue was disconnected.
    Disconnected,
    /// A tunnel handle was set on a buffer.
    TunnelHandleChanged(SequenceNumber),
    /// The consumer asked the queue to drop its cached buffers.
    CleanCache,
    /// The consumer went to the background; cached buffers were dropped.
    GoBackground,
    /// A buffer was retired from or detached out of the queue.
    BufferDeleted(SequenceNumber),
    /// The consumer released a buffer back to FREE.
    BufferReleased(SequenceNumber),
}

/// Capability interface for queue notifications.
///
/// Only [`on_buffer_available`](BufferQueueListener::on_buffer_available) is required.
pub trait BufferQueueListener: Send + Sync {
    /// Called once per successful flush, after the buffer is visible as queued.
    fn on_buffer_available(&self);

    fn on_disconnect(&self) {}

    fn on_tunnel_handle_change(&self, _sequence: SequenceNumber) {}

    fn on_clean_cache(&self) {}

    fn on_go_background(&self) {}

    fn on_buffer_deleted(&self, _sequence: SequenceNumber) {}

    /// Called on the producer's release listener after each successful release.
    fn on_buffer_released(&self, _sequence: SequenceNumber) {}
}

/// Routes `event` to the matching callback of `listener`.
pub(crate) fn deliver(listener: &dyn BufferQueueListener, event: QueueEvent) {
    match event {
        QueueEvent::BufferAvailable => listener.on_buffer_available(),
        QueueEvent::Disconnected => listener.on_disconnect(),
        QueueEvent::TunnelHandleChanged(sequence) => listener.on_tunnel_handle_change(sequence),
        QueueEvent::CleanCache => listener.on_clean_cache(),
        QueueEvent::GoBackground => listener.on_go_background(),
        QueueEvent::BufferDeleted(sequence) => listener.on_buffer_deleted(sequence),
        QueueEvent::BufferReleased(sequence) => listener.on_buffer_released(sequence),
    }
}

/// Listener that posts every event onto a channel.
///
/// The consumer keeps the [`Arc`] alive for as long as it wants notifications and
/// drains the [`Receiver`] on its own thread.
#[derive(Debug)]
pub struct ChannelListener {
    sender: Sender<QueueEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, Receiver<QueueEvent>) {
        let (sender, receiver) = unbounded();
        (Arc::new(Self { sender }), receiver)
    }

    fn post(&self, event: QueueEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!(?event, "Queue event dropped, receiver is gone");
        }
    }
}

impl BufferQueueListener for ChannelListener {
    fn on_buffer_available(&self) {
        self.post(QueueEvent::BufferAvailable);
    }

    fn on_disconnect(&self) {
        self.post(QueueEvent::Disconnected);
    }

    fn on_tunnel_handle_change(&self, sequence: SequenceNumber) {
        self.post(QueueEvent::TunnelHandleChanged(sequence));
    }

    fn on_clean_cache(&self) {
        self.post(QueueEvent::CleanCache);
    }

    fn on_go_background(&self) {
        self.post(QueueEvent::GoBackground);
    }

    fn on_buffer_deleted(&self, sequence: SequenceNumber) {
        self.post(QueueEvent::BufferDeleted(sequence));
    }

    fn on_buffer_released(&self, sequence: SequenceNumber) {
        self.post(QueueEvent::BufferReleased(sequence));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        available: AtomicUsize,
    }

    impl BufferQueueListener for Counting {
        fn on_buffer_available(&self) {
            self.available.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_callbacks_are_noops() {
        let listener = Counting::default();
        deliver(&listener, QueueEvent::Disconnected);
        deliver(&listener, QueueEvent::BufferDeleted(SequenceNumber::new(1)));
        deliver(&listener, QueueEvent::BufferAvailable);
        assert_eq!(listener.available.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_listener_forwards_events() {
        let (listener, events) = ChannelListener::new();
        let sequence = SequenceNumber::new(42);

        deliver(listener.as_ref(), QueueEvent::BufferAvailable);
        deliver(listener.as_ref(), QueueEvent::TunnelHandleChanged(sequence));
        deliver(listener.as_ref(), QueueEvent::CleanCache);
        deliver(listener.as_ref(), QueueEvent::BufferReleased(sequence));

        let received: Vec<QueueEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                QueueEvent::BufferAvailable,
                QueueEvent::TunnelHandleChanged(sequence),
                QueueEvent::CleanCache,
                QueueEvent::BufferReleased(sequence),
            ]
        );
    }

    #[test]
    fn test_channel_listener_survives_dropped_receiver() {
        let (listener, events) = ChannelListener::new();
        drop(events);
        listener.on_buffer_available();
    }
}
