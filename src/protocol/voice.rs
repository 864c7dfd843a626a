use serde::Deserialize;

use crate::common::types::{ChannelId, GuildId, UserId};

/// Raw `VOICE_STATE_UPDATE` payload forwarded by the host bot.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: Option<GuildId>,
    /// Null when the user left the voice channel.
    pub channel_id: Option<ChannelId>,
    pub user_id: UserId,
    pub session_id: String,
}

/// Raw `VOICE_SERVER_UPDATE` payload forwarded by the host bot.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: GuildId,
    pub token: String,
    /// Null while the platform allocates a voice server.
    pub endpoint: Option<String>,
}

/// Reduce a platform voice endpoint to a bare hostname.
///
/// The platform has historically sent `hostname:port`, bare hostnames and
/// full URLs here; the node wants only the hostname.
pub fn normalize_endpoint(raw: &str) -> String {
    let without_scheme = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };
    let host_port = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme);
    match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => host_port.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_port() {
        assert_eq!(normalize_endpoint("eu.example:443"), "eu.example");
    }

    #[test]
    fn test_normalize_strips_scheme_and_path() {
        assert_eq!(normalize_endpoint("wss://eu.example:443/"), "eu.example");
        assert_eq!(normalize_endpoint("wss://eu.example"), "eu.example");
    }

    #[test]
    fn test_normalize_passes_bare_hostname() {
        assert_eq!(
            normalize_endpoint("rotterdam10533.discord.media"),
            "rotterdam10533.discord.media"
        );
    }

    #[test]
    fn test_voice_state_update_parses_null_channel() {
        let json = r#"{
            "guild_id": "41771983423143937",
            "channel_id": null,
            "user_id": "80351110224678912",
            "session_id": "dd12345f1c7e41b1"
        }"#;
        let update: VoiceStateUpdate = serde_json::from_str(json).unwrap();
        assert!(update.channel_id.is_none());
        assert_eq!(update.user_id, UserId(80351110224678912));
    }

    #[test]
    fn test_voice_server_update_parses() {
        let json = r#"{
            "token": "my_token",
            "guild_id": "41771983423143937",
            "endpoint": "smart.loyal.discord.media:443"
        }"#;
        let update: VoiceServerUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(
            normalize_endpoint(update.endpoint.as_deref().unwrap()),
            "smart.loyal.discord.media"
        );
    }
}
