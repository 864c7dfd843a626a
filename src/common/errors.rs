use serde::{Deserialize, Serialize};

use crate::common::types::GuildId;

/// Exception severity levels, as reported by the audio node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

/// Lavalink v4 JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// HTTP status code.
    pub status: u16,
    /// HTTP status reason phrase (e.g. "Bad Request").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// The request path that caused the error.
    pub path: String,
    /// Stack trace (only in non-production servers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Everything that can go wrong inside the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node `{identifier}` has invalid options: {reason}")]
    InvalidNodeOptions { identifier: String, reason: String },

    #[error("bot user id has not been set")]
    MissingUserId,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request to {path} timed out after {attempts} attempt(s)")]
    RestTimeout { path: String, attempts: u32 },

    /// Non-2xx REST response with the server's parsed error body.
    #[error("node returned {status} for {path}: {message}")]
    Api {
        status: u16,
        path: String,
        message: String,
        response: Option<ErrorResponse>,
    },

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A session-scoped endpoint was used before the node received `ready`.
    #[error("node `{0}` has no active session")]
    NoSession(String),

    /// The node session was invalidated by the server (404 on a session path).
    #[error("node `{0}` session is no longer valid")]
    SessionInvalid(String),

    #[error("node `{0}` is not ready")]
    NodeNotReady(String),

    /// The node exhausted its reconnect budget or hit a permanent close code.
    #[error("node `{0}` has permanently failed")]
    NodeFailed(String),

    #[error("no node is available to host the player")]
    NoAvailableNode,

    #[error("cannot {operation} while the player for guild {guild_id} is {state}")]
    WrongState {
        guild_id: GuildId,
        operation: &'static str,
        state: &'static str,
    },

    #[error("player for guild {0} has no current track")]
    NoCurrentTrack(GuildId),

    #[error("current track for guild {0} is not seekable")]
    NotSeekable(GuildId),

    #[error("a voice connect is already in flight for guild {0}")]
    ConnectInProgress(GuildId),

    #[error("player for guild {0} is already on that node")]
    SameNode(GuildId),

    #[error("voice handshake for guild {0} timed out")]
    ConnectTimeout(GuildId),

    #[error("voice connection for guild {guild_id} failed: {reason}")]
    ConnectionFailed { guild_id: GuildId, reason: String },

    #[error("player for guild {0} was destroyed")]
    PlayerDestroyed(GuildId),

    #[error("failed to send voice payload to the platform: {0}")]
    PayloadSend(String),
}

impl Error {
    /// True for transport-level failures where a retry can help.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::WebSocket(_) | Self::RestTimeout { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_wire_format() {
        assert_eq!(serde_json::to_string(&Severity::Common).unwrap(), "\"common\"");
        assert_eq!(
            serde_json::to_string(&Severity::Suspicious).unwrap(),
            "\"suspicious\""
        );
        assert_eq!(serde_json::to_string(&Severity::Fault).unwrap(), "\"fault\"");

        let parsed: Severity = serde_json::from_str("\"fault\"").unwrap();
        assert_eq!(parsed, Severity::Fault);
    }

    #[test]
    fn test_error_response_parses_v4_body() {
        let body = r#"{
            "timestamp": 1667857581613,
            "status": 404,
            "error": "Not Found",
            "message": "Session not found",
            "path": "/v4/sessions/xtaug914v9k5032f/players/817327181659111454"
        }"#;
        let parsed: ErrorResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.status, 404);
        assert_eq!(parsed.error, "Not Found");
        assert!(parsed.trace.is_none());
    }
}
