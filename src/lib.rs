//! Resilient command/event channel connecting a local playback client to a
//! music-bot orchestration server.
//!
//! The channel maintains a persistent websocket link with automatic
//! recovery, drains a bounded outbound command queue onto it, and routes
//! inbound frames onto a process-wide event bus. Playback and presence are
//! consumed as capabilities ([`player::Player`], [`notifier::Notifier`]).

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;

pub mod auth;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod notifier;
pub mod player;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod token;
