//! Presence capability and its event-bus driver.
//!
//! Presence ("listening to ...") is an external surface consumed through
//! the [`Notifier`] capability; the [`NotifierDriver`] keeps it in sync
//! with song lifecycle events.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventBus};

/// Presence display capability.
#[async_trait]
pub trait Notifier: Send {
    /// Shows the given song title, or clears the display on `None`.
    async fn now_playing(&mut self, title: Option<&str>);
}

/// Feeds song lifecycle events into a [`Notifier`].
pub struct NotifierDriver<N> {
    notifier: N,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl<N> NotifierDriver<N>
where
    N: Notifier,
{
    pub fn new(notifier: N, bus: EventBus, shutdown: CancellationToken) -> Self {
        Self {
            notifier,
            bus,
            shutdown,
        }
    }

    /// Runs until shut down.
    pub async fn run(mut self) {
        use tokio::sync::broadcast::error::RecvError;

        let mut events = self.bus.subscribe();
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,

                event = events.recv() => match event {
                    Ok(Event::SongStarted(song)) => {
                        self.notifier.now_playing(Some(&song.title)).await;
                    }
                    Ok(Event::SongStopped | Event::SongFinished | Event::Disconnected) => {
                        self.notifier.now_playing(None).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(count)) => {
                        warn!("event bus lagged by {count} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}
