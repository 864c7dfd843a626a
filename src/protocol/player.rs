use serde::{Deserialize, Serialize};

use crate::{common::types::GuildId, protocol::tracks::Track};

/// Full player state as returned by the player REST endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub guild_id: GuildId,
    pub track: Option<Track>,
    pub volume: u16,
    pub paused: bool,
    pub state: PlayerState,
    pub voice: VoiceState,
    #[serde(default)]
    pub filters: Filters,
}

/// Live playback state, delivered in `playerUpdate` frames and REST responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Unix timestamp in milliseconds.
    pub time: u64,
    /// Playback position in milliseconds.
    #[serde(default)]
    pub position: u64,
    /// Whether the node is connected to the voice gateway.
    pub connected: bool,
    /// Voice gateway ping in milliseconds. -1 when unavailable.
    pub ping: i64,
}

/// Voice connection parameters forwarded from the platform to the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// `encodedTrack` in a player update: omitted keeps the current track,
/// `null` stops it, a string replaces it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TrackEncoded {
    Clear,       // JSON: null
    Set(String), // JSON: string
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EndTime {
    Clear,    // JSON: null
    Set(u64), // JSON: number
}

/// Request body for PATCH /v4/sessions/{sessionId}/players/{guildId}.
///
/// Every field is optional; omitted fields keep their server-side value.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<TrackEncoded>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<EndTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

/// Audio filter passthrough. The client never interprets these; they travel
/// verbatim to the node, which applies the DSP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<EqBand>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<KaraokeFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<TimescaleFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<TremoloFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<VibratoFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distortion: Option<DistortionFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMixFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPassFilter>,
}

impl Filters {
    /// Returns true if every filter field is `None`.
    pub fn is_empty(&self) -> bool {
        self.volume.is_none()
            && self.equalizer.is_none()
            && self.karaoke.is_none()
            && self.timescale.is_none()
            && self.tremolo.is_none()
            && self.vibrato.is_none()
            && self.distortion.is_none()
            && self.rotation.is_none()
            && self.channel_mix.is_none()
            && self.low_pass.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EqBand {
    pub band: u8,
    pub gain: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KaraokeFilter {
    pub level: Option<f32>,
    pub mono_level: Option<f32>,
    pub filter_band: Option<f32>,
    pub filter_width: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimescaleFilter {
    pub speed: Option<f64>,
    pub pitch: Option<f64>,
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TremoloFilter {
    pub frequency: Option<f32>,
    pub depth: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VibratoFilter {
    pub frequency: Option<f32>,
    pub depth: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistortionFilter {
    pub sin_offset: Option<f32>,
    pub sin_scale: Option<f32>,
    pub cos_offset: Option<f32>,
    pub cos_scale: Option<f32>,
    pub tan_offset: Option<f32>,
    pub tan_scale: Option<f32>,
    pub offset: Option<f32>,
    pub scale: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationFilter {
    pub rotation_hz: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMixFilter {
    pub left_to_left: Option<f32>,
    pub left_to_right: Option<f32>,
    pub right_to_left: Option<f32>,
    pub right_to_right: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowPassFilter {
    pub smoothing: Option<f32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_omits_unset_fields() {
        let update = PlayerUpdate {
            paused: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({ "paused": true }));
    }

    #[test]
    fn test_encoded_track_null_vs_string() {
        let stop = PlayerUpdate {
            encoded_track: Some(TrackEncoded::Clear),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&stop).unwrap(),
            serde_json::json!({ "encodedTrack": null })
        );

        let play = PlayerUpdate {
            encoded_track: Some(TrackEncoded::Set("QAAA...".to_string())),
            paused: Some(false),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&play).unwrap(),
            serde_json::json!({ "encodedTrack": "QAAA...", "paused": false })
        );
    }

    #[test]
    fn test_voice_patch_shape() {
        let update = PlayerUpdate {
            voice: Some(VoiceState {
                token: "tok".to_string(),
                endpoint: "eu.example".to_string(),
                session_id: "vs".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({
                "voice": { "token": "tok", "endpoint": "eu.example", "sessionId": "vs" }
            })
        );
    }

    #[test]
    fn test_empty_filters_serialize_to_empty_object() {
        let filters = Filters::default();
        assert!(filters.is_empty());
        assert_eq!(serde_json::to_value(&filters).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn test_player_info_parses_rest_response() {
        let json = r#"{
            "guildId": "123",
            "track": null,
            "volume": 100,
            "paused": false,
            "state": { "time": 1500467109, "position": 0, "connected": false, "ping": -1 },
            "voice": { "token": "", "endpoint": "", "sessionId": "" },
            "filters": {}
        }"#;
        let info: PlayerInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.guild_id.0, "123");
        assert!(info.track.is_none());
        assert_eq!(info.state.ping, -1);
    }
}
