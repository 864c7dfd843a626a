use crate::{
    common::types::{GuildId, SessionId},
    protocol::{PlayerState, Stats, Track, TrackEndReason, TrackException},
};

/// Everything the library reports back to the host, delivered over the flume
/// receiver handed out at manager construction.
///
/// Delivery is fire-and-forget: a lagging or dropped receiver never blocks
/// playback.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A node's WebSocket opened; `ready` has not arrived yet.
    NodeConnect { node: String },
    /// A node completed its handshake and can host players.
    NodeReady {
        node: String,
        resumed: bool,
        session_id: SessionId,
    },
    NodeDisconnect {
        node: String,
        code: u16,
        reason: String,
    },
    NodeError {
        node: String,
        context: String,
        error: String,
    },
    NodeStats { node: String, stats: Stats },

    PlayerCreate { guild_id: GuildId },
    PlayerDestroy { guild_id: GuildId },
    /// A player was migrated between nodes.
    PlayerMove {
        guild_id: GuildId,
        from: String,
        to: String,
    },
    /// Periodic position/ping refresh from the node.
    PlayerStateUpdate {
        guild_id: GuildId,
        state: PlayerState,
    },
    /// The node's own voice connection to the platform closed.
    PlayerWebsocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
        by_remote: bool,
    },

    TrackStart { guild_id: GuildId, track: Track },
    TrackEnd {
        guild_id: GuildId,
        track: Track,
        reason: TrackEndReason,
    },
    TrackException {
        guild_id: GuildId,
        track: Track,
        exception: TrackException,
    },
    TrackStuck {
        guild_id: GuildId,
        track: Track,
        threshold_ms: u64,
    },
    /// The queue ran dry and playback stopped.
    QueueEnd { guild_id: GuildId },

    Debug { message: String },
}

/// Sender side used throughout the crate. Send failures mean the host dropped
/// the receiver, which is not an error.
pub(crate) type EventSink = flume::Sender<ClientEvent>;

pub(crate) fn emit(sink: &EventSink, event: ClientEvent) {
    let _ = sink.send(event);
}
