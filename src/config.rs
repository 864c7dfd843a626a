use serde::Deserialize;

use crate::common::{Error, Result};

/// Connection options for a single audio node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOptions {
    /// Unique name for this node within the manager.
    pub identifier: String,
    pub host: String,
    pub port: u16,
    /// Use wss/https instead of ws/http.
    #[serde(default)]
    pub secure: bool,
    pub password: String,
    /// When set, the node is asked to keep the session alive across
    /// disconnects and the client resumes it on reconnect.
    #[serde(default)]
    pub resume_key: Option<String>,
    /// Seconds the node keeps a resumable session alive.
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout_secs: u64,
    /// REST retry budget for transport failures.
    #[serde(default = "default_retry_amount")]
    pub retry_amount: u32,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_resume_timeout() -> u64 {
    60
}

fn default_retry_amount() -> u32 {
    3
}

impl NodeOptions {
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(Error::InvalidNodeOptions {
                identifier: self.identifier.clone(),
                reason: reason.to_string(),
            })
        };
        if self.identifier.trim().is_empty() {
            return fail("identifier must not be empty");
        }
        if self.host.trim().is_empty() || self.host.contains('/') {
            return fail("host must be a bare hostname or address");
        }
        if self.port == 0 {
            return fail("port must be non-zero");
        }
        if self.password.is_empty() {
            return fail("password must not be empty");
        }
        // The password travels in HTTP headers verbatim.
        if !self.password.is_ascii() || self.password.chars().any(|c| c.is_ascii_control()) {
            return fail("password must be printable ASCII");
        }
        Ok(())
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }

    pub fn rest_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// WebSocket reconnect schedule: `min(initial << attempt, max)` per attempt,
/// giving up after `max_tries`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_tries() -> u32 {
    10
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            max_tries: default_max_tries(),
        }
    }
}

/// Per-player defaults applied at creation time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerOptions {
    #[serde(default = "default_volume")]
    pub initial_volume: u16,
    #[serde(default = "default_true")]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
}

fn default_volume() -> u16 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            initial_volume: default_volume(),
            self_deaf: true,
            self_mute: false,
        }
    }
}
