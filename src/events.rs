//! Process-wide event bus connecting the channel, the player, and the
//! notifier.
//!
//! The bus is a thin wrapper over a [`tokio::sync::broadcast`] channel:
//! publishing never blocks the publisher, every subscriber gets its own
//! receiver, and producers and consumers stay decoupled and testable in
//! isolation.

use tokio::sync::broadcast;

use crate::protocol::{InboundEvent, Song};

/// Capacity of each subscriber's buffer before it starts lagging. Sized so
/// a subscriber stalled on a backpressured queue can absorb a burst of
/// unrelated events without dropping any.
pub(crate) const SUBSCRIBER_BUFFER: usize = 64;

/// Events carried on the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The player started a song.
    SongStarted(Song),

    /// The player stopped on request.
    SongStopped,

    /// The current song ended, naturally or through a player error.
    SongFinished,

    /// The local play queue is running low or empty; the channel translates
    /// this into an outbound song request.
    QueueLowOrEmpty,

    /// A decoded message from the orchestration server.
    Remote(InboundEvent),

    /// The channel established a connection.
    Connected,

    /// The channel lost its connection.
    Disconnected,
}

/// Publish/subscribe hub for [`Event`]s.
///
/// Clones share the same bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// An event published while nobody is subscribed is dropped.
    pub fn publish(&self, event: Event) {
        trace!("publishing {event:?}");
        if self.tx.send(event).is_err() {
            trace!("no subscribers");
        }
    }

    /// Subscribes to all events published from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(Event::QueueLowOrEmpty);

        assert_eq!(first.recv().await.unwrap(), Event::QueueLowOrEmpty);
        assert_eq!(second.recv().await.unwrap(), Event::QueueLowOrEmpty);
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let bus = EventBus::new();
        let mut early = bus.subscribe();

        bus.publish(Event::SongStopped);
        let mut late = bus.subscribe();
        bus.publish(Event::SongFinished);

        assert_eq!(early.recv().await.unwrap(), Event::SongStopped);
        assert_eq!(early.recv().await.unwrap(), Event::SongFinished);
        assert_eq!(late.recv().await.unwrap(), Event::SongFinished);
    }
}
