//! Playback capability and its event-bus driver.
//!
//! Actual audio decoding and output live behind the [`Player`] trait; this
//! crate only steers it. The [`PlayerDriver`] subscribes to decoded remote
//! events, invokes the capability, and publishes the resulting lifecycle
//! events back onto the bus.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{Event, EventBus},
    protocol::{InboundEvent, Song},
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct Error(pub String);

/// Media playback capability consumed by the channel.
#[async_trait]
pub trait Player: Send {
    /// Starts playback of the given song, replacing any current one.
    async fn play(&mut self, song: &Song) -> Result<()>;

    /// Pauses playback, keeping the current position.
    async fn pause(&mut self) -> Result<()>;

    /// Stops playback.
    async fn stop(&mut self) -> Result<()>;

    /// Sets the playback volume in percent.
    async fn set_volume(&mut self, volume: u8) -> Result<()>;
}

/// Steers a [`Player`] from remote events and reports its lifecycle.
pub struct PlayerDriver<P> {
    player: P,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl<P> PlayerDriver<P>
where
    P: Player,
{
    pub fn new(player: P, bus: EventBus, shutdown: CancellationToken) -> Self {
        Self {
            player,
            bus,
            shutdown,
        }
    }

    /// Runs until shut down.
    pub async fn run(mut self) {
        use tokio::sync::broadcast::error::RecvError;

        let mut events = self.bus.subscribe();
        loop {
            let event = tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(Event::Remote(event)) => event,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(count)) => {
                        warn!("event bus lagged by {count} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                }
            };

            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Play(song) => {
                info!("play: {song}");
                match self.player.play(&song).await {
                    Ok(()) => self.bus.publish(Event::SongStarted(song)),
                    Err(e) => {
                        // A song that cannot start counts as finished, so
                        // the server gets asked for the next one.
                        error!("error playing {song}: {e}");
                        self.bus.publish(Event::SongFinished);
                    }
                }
            }
            InboundEvent::Pause => {
                info!("pause");
                if let Err(e) = self.player.pause().await {
                    error!("error pausing: {e}");
                }
            }
            InboundEvent::Stop => {
                info!("stop");
                match self.player.stop().await {
                    Ok(()) => self.bus.publish(Event::SongStopped),
                    Err(e) => error!("error stopping: {e}"),
                }
            }
            InboundEvent::Skip => {
                info!("skip");
                match self.player.stop().await {
                    Ok(()) => self.bus.publish(Event::SongFinished),
                    Err(e) => error!("error skipping: {e}"),
                }
            }
            InboundEvent::SetVolume(volume) => {
                info!("volume: {volume}%");
                if let Err(e) = self.player.set_volume(volume).await {
                    error!("error setting volume: {e}");
                }
            }
            InboundEvent::Unknown { .. } => {}
        }
    }
}
