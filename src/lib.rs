//! Multi-node Lavalink v4 client for chat-platform bots.
//!
//! A [`Manager`] owns a fleet of audio [`Node`]s and one [`Player`] per
//! guild. The host wires two things: a [`PayloadSender`] that delivers voice
//! gateway payloads to the platform, and the two `handle_voice_*` entry
//! points fed with raw `VOICE_STATE_UPDATE` / `VOICE_SERVER_UPDATE` events.
//! Everything else — the node handshake and session resumption, reconnect
//! backoff, queueing, penalty-based routing and player migration — happens
//! behind those seams, with progress reported on the [`ClientEvent`] stream.

pub mod common;
pub mod config;
pub mod events;
pub mod manager;
pub mod node;
pub mod player;
pub mod protocol;
pub mod rest;

pub use common::{Error, ErrorResponse, Result, Severity};
pub use common::types::{ChannelId, GuildId, SessionId, UserId};
pub use config::{NodeOptions, PlayerOptions, ReconnectPolicy};
pub use events::ClientEvent;
pub use manager::{Manager, PayloadSender};
pub use node::{Node, NodeState};
pub use player::{LoopMode, PlayOptions, Player, PlayerStatus, Queue};
pub use protocol::{LoadResult, Track, TrackEndReason};
