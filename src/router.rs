//! Resolves inbound frames into typed events.
//!
//! The router holds a fixed registry mapping the `type` header of a
//! [`Frame`] to a decode function. The registry is populated once at
//! construction; a missing entry is a normal, handled case that degrades to
//! [`InboundEvent::Unknown`] rather than an error path.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{Frame, InboundEvent, Song};

/// A decode function turning a frame body into a typed event.
type Decoder = fn(&Value) -> Result<InboundEvent>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("parsing JSON error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Routes inbound frames by their declared payload type.
pub struct Router {
    registry: HashMap<&'static str, Decoder>,
}

impl Router {
    /// Creates a router with the fixed set of known payload schemas.
    #[must_use]
    pub fn new() -> Self {
        let mut registry: HashMap<&'static str, Decoder> = HashMap::new();
        registry.insert("Song", decode_song);
        registry.insert("SimpleCommand", decode_simple_command);
        registry.insert("Volume", decode_volume);

        Self { registry }
    }

    /// Resolves a frame into an [`InboundEvent`].
    ///
    /// Typing failures are recoverable: the routing error is logged and the
    /// frame degrades to [`InboundEvent::Unknown`], so the bus observes
    /// receipt regardless.
    #[must_use]
    pub fn route(&self, frame: Frame) -> InboundEvent {
        let Some(kind) = frame.headers.kind else {
            error!("type header missing");
            return InboundEvent::Unknown {
                kind: None,
                body: frame.body,
            };
        };

        let Some(decode) = self.registry.get(kind.as_str()) else {
            error!("unknown inbound type: {kind}");
            return InboundEvent::Unknown {
                kind: Some(kind),
                body: frame.body,
            };
        };

        match decode(&frame.body) {
            Ok(event) => event,
            Err(e) => {
                error!("error decoding {kind} payload: {e}");
                InboundEvent::Unknown {
                    kind: Some(kind),
                    body: frame.body,
                }
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_song(body: &Value) -> Result<InboundEvent> {
    let song = serde_json::from_value::<Song>(body.clone())?;
    Ok(InboundEvent::Play(song))
}

fn decode_simple_command(body: &Value) -> Result<InboundEvent> {
    let command = body
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidPayload("command field missing".to_string()))?;

    match command {
        "PAUSE" => Ok(InboundEvent::Pause),
        "STOP" => Ok(InboundEvent::Stop),
        "SKIP" => Ok(InboundEvent::Skip),
        other => Err(Error::InvalidPayload(format!(
            "unknown simple command: {other}"
        ))),
    }
}

fn decode_volume(body: &Value) -> Result<InboundEvent> {
    let volume = body
        .get("volume")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::InvalidPayload("volume field missing".to_string()))?;

    let volume = u8::try_from(volume)
        .ok()
        .filter(|volume| *volume <= 100)
        .ok_or_else(|| Error::InvalidPayload(format!("volume out of range: {volume}")))?;

    Ok(InboundEvent::SetVolume(volume))
}
