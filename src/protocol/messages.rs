use serde::{Deserialize, Serialize};

use crate::{
    common::{Severity, types::{GuildId, SessionId}},
    protocol::{player::PlayerState, stats::Stats, tracks::Track},
};

/// Messages received from a node over WebSocket, discriminated by `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Ready {
        resumed: bool,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    #[serde(rename = "playerUpdate")]
    PlayerUpdate {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        state: PlayerState,
    },
    #[serde(rename = "stats")]
    Stats {
        #[serde(flatten)]
        stats: Stats,
    },
    #[serde(rename = "event")]
    Event {
        #[serde(flatten)]
        event: NodeEvent,
    },
}

/// Player events delivered with `op = "event"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
    },

    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        exception: TrackException,
    },

    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },

    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        code: u16,
        reason: String,
        /// `true` if the platform closed the connection; `false` if the node did.
        #[serde(rename = "byRemote")]
        by_remote: bool,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> &GuildId {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::WebSocketClosed { guild_id, .. } => guild_id,
        }
    }
}

/// Why a track stopped playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    /// Track played to the end (or ended due to an exception after starting).
    Finished,
    /// Track failed to start before providing any audio.
    LoadFailed,
    /// Player was explicitly stopped.
    Stopped,
    /// A new track started playing, replacing this one.
    Replaced,
    /// Player cleanup threshold reached on the node.
    Cleanup,
}

impl TrackEndReason {
    /// Whether the queue may progress to the next track after this reason.
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

/// Exception details for `TrackExceptionEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_stack_trace: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_frame_parses() {
        let json = r#"{"op":"ready","resumed":false,"sessionId":"la3kfsdf5eafe848"}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        let IncomingMessage::Ready { resumed, session_id } = msg else {
            panic!("expected ready");
        };
        assert!(!resumed);
        assert_eq!(session_id.0, "la3kfsdf5eafe848");
    }

    #[test]
    fn test_player_update_frame_parses() {
        let json = r#"{
            "op": "playerUpdate",
            "guildId": "229087155907068160",
            "state": { "time": 1500467109, "position": 60000, "connected": true, "ping": 50 }
        }"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        let IncomingMessage::PlayerUpdate { guild_id, state } = msg else {
            panic!("expected playerUpdate");
        };
        assert_eq!(guild_id.0, "229087155907068160");
        assert_eq!(state.position, 60000);
        assert!(state.connected);
    }

    #[test]
    fn test_stats_frame_parses_flattened() {
        let json = r#"{
            "op": "stats",
            "players": 1,
            "playingPlayers": 1,
            "uptime": 123456789,
            "memory": { "free": 1, "used": 2, "allocated": 3, "reservable": 4 },
            "cpu": { "cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.2 }
        }"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        let IncomingMessage::Stats { stats } = msg else {
            panic!("expected stats");
        };
        assert_eq!(stats.players, 1);
    }

    #[test]
    fn test_track_end_event_parses() {
        let json = r#"{
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "1",
            "track": {
                "encoded": "abc",
                "info": {
                    "identifier": "x", "isSeekable": true, "author": "a", "length": 1000,
                    "isStream": false, "position": 0, "title": "t", "uri": null,
                    "artworkUrl": null, "isrc": null, "sourceName": "youtube"
                }
            },
            "reason": "finished"
        }"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        let IncomingMessage::Event { event: NodeEvent::TrackEnd { reason, .. } } = msg else {
            panic!("expected TrackEndEvent");
        };
        assert_eq!(reason, TrackEndReason::Finished);
        assert!(reason.may_start_next());
    }

    #[test]
    fn test_websocket_closed_event_parses() {
        let json = r#"{
            "op": "event",
            "type": "WebSocketClosedEvent",
            "guildId": "1",
            "code": 4006,
            "reason": "Your session is no longer valid.",
            "byRemote": true
        }"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        let IncomingMessage::Event { event: NodeEvent::WebSocketClosed { code, by_remote, .. } } =
            msg
        else {
            panic!("expected WebSocketClosedEvent");
        };
        assert_eq!(code, 4006);
        assert!(by_remote);
    }

    #[test]
    fn test_unknown_op_is_a_parse_error() {
        // The read loop downgrades these to a debug log.
        let json = r#"{"op":"somethingNew","data":1}"#;
        assert!(serde_json::from_str::<IncomingMessage>(json).is_err());
    }

    #[test]
    fn test_end_reason_progression_rules() {
        assert!(TrackEndReason::Finished.may_start_next());
        assert!(TrackEndReason::LoadFailed.may_start_next());
        assert!(!TrackEndReason::Stopped.may_start_next());
        assert!(!TrackEndReason::Replaced.may_start_next());
        assert!(!TrackEndReason::Cleanup.may_start_next());
    }
}
