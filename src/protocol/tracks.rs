use serde::{Deserialize, Serialize};

use crate::common::Severity;

/// A single audio track as produced by a node.
///
/// The `encoded` blob is opaque to the client; it round-trips between
/// `loadtracks` responses and player update requests without inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Base64-encoded track data.
    pub encoded: String,
    /// Track metadata.
    pub info: TrackInfo,
    /// Plugin-specific info — free JSON object whose shape is defined by the plugin.
    #[serde(default = "default_json_object")]
    pub plugin_info: serde_json::Value,
    /// User-provided data attached to the track.
    #[serde(default = "default_json_object")]
    pub user_data: serde_json::Value,
}

fn default_json_object() -> serde_json::Value {
    serde_json::json!({})
}

impl Track {
    /// Attach a requester annotation under `userData.requester`.
    ///
    /// The node echoes `userData` back verbatim, so the annotation survives
    /// queue round-trips and node transfers.
    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        if !self.user_data.is_object() {
            self.user_data = serde_json::json!({});
        }
        if let Some(map) = self.user_data.as_object_mut() {
            map.insert(
                "requester".to_string(),
                serde_json::Value::String(requester.into()),
            );
        }
        self
    }

    pub fn requester(&self) -> Option<&str> {
        self.user_data.get("requester").and_then(|v| v.as_str())
    }
}

/// Metadata for an audio track.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds. 0 for live streams.
    pub length: u64,
    pub is_stream: bool,
    /// Playback position in milliseconds at encode time.
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

/// Result of a track load operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    /// A single track was loaded.
    Track(Track),
    /// A playlist was loaded.
    Playlist(PlaylistData),
    /// A search returned results.
    Search(Vec<Track>),
    /// No matches found.
    Empty {},
    /// An error occurred during loading.
    Error(LoadError),
}

impl LoadResult {
    /// Flatten into the tracks the caller can enqueue, in result order.
    pub fn tracks(&self) -> Vec<Track> {
        match self {
            Self::Track(track) => vec![track.clone()],
            Self::Playlist(playlist) => playlist.tracks.clone(),
            Self::Search(tracks) => tracks.clone(),
            Self::Empty {} | Self::Error(_) => Vec::new(),
        }
    }
}

/// Playlist data returned from a load operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(default = "default_json_object")]
    pub plugin_info: serde_json::Value,
    pub tracks: Vec<Track>,
}

/// Playlist metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the selected track, or -1 if none.
    pub selected_track: i32,
}

/// Error from a failed track load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadError {
    /// Human-readable error message.
    pub message: Option<String>,
    /// How severe the error is.
    pub severity: Severity,
    /// Exception class / short cause description.
    pub cause: String,
    /// Full stack trace, if available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause_stack_trace: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
