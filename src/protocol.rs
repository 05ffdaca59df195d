//! Wire types exchanged with the orchestration server.
//!
//! Outbound traffic consists of [`Command`] objects, serialized as JSON with
//! a `command` discriminant field and sent one per websocket message.
//! Inbound traffic consists of [`Frame`]s whose `type` header names the
//! payload schema; the [router](crate::router) resolves the header into a
//! typed [`InboundEvent`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outbound instruction destined for the orchestration server.
///
/// Immutable once enqueued; delivered in FIFO order by the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Ask the server to push the next song. Raised when the local play
    /// queue runs low or empty.
    RequestSong,

    /// Report the local playback state.
    StatusUpdate {
        state: PlaybackState,
        #[serde(skip_serializing_if = "Option::is_none")]
        song: Option<String>,
    },
}

/// Local playback state as reported in [`Command::StatusUpdate`].
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Stopped,
}

/// One discrete inbound message unit.
///
/// Both fields are lenient: a frame without headers or body still
/// deserializes, so receipt can be observed even when typing fails.
#[derive(Clone, Debug, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Value,
}

/// Frame headers. The `type` header names the payload schema.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Headers {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// A song pushed by the server for local playback.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Song {
    #[serde(rename = "songlink")]
    pub link: String,
    #[serde(rename = "songtitle")]
    pub title: String,
}

impl fmt::Display for Song {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title, self.link)
    }
}

/// A decoded message received from the orchestration server.
///
/// `Unknown` is the degraded representation for frames whose `type` header
/// is missing, unrecognized, or whose payload failed to decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    /// Start playback of the given song.
    Play(Song),
    /// Pause playback, keeping the current position.
    Pause,
    /// Stop playback.
    Stop,
    /// Abort the current song and advance.
    Skip,
    /// Set the playback volume in percent.
    SetVolume(u8),
    /// A frame that could not be typed. Carries the declared type name, if
    /// any, and the raw payload.
    Unknown { kind: Option<String>, body: Value },
}
