use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    common::{Error, ErrorResponse, Result, http::HttpClient, types::{GuildId, SessionId}},
    config::NodeOptions,
    protocol::{
        Info, LoadResult, PlayerInfo, PlayerUpdate, SessionInfo, SessionUpdate, Stats, Track,
    },
};

/// Linear REST retry step: attempt n sleeps `n * 500ms` before retrying.
const RETRY_STEP: Duration = Duration::from_millis(500);

/// Authenticated REST access to one audio node.
///
/// Transport failures (timeout, refused connection) retry with linear
/// backoff up to the configured budget; any HTTP response, success or not,
/// ends the retry loop.
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    identifier: String,
    retry_amount: u32,
}

impl RestClient {
    pub fn new(options: &NodeOptions) -> Result<Self> {
        Ok(Self {
            http: HttpClient::for_node(&options.password)?,
            base: options.rest_base(),
            identifier: options.identifier.clone(),
            retry_amount: options.retry_amount.max(1),
        })
    }

    /// `GET /version` — the only plain-text endpoint.
    pub async fn version(&self) -> Result<String> {
        let response = self.send(Method::GET, "/version", &[], None).await?;
        Ok(response.text().await?)
    }

    pub async fn info(&self) -> Result<Info> {
        self.request(Method::GET, "/v4/info", &[], None).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.request(Method::GET, "/v4/stats", &[], None).await
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.request(
            Method::GET,
            "/v4/loadtracks",
            &[("identifier", identifier.to_string())],
            None,
        )
        .await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        self.request(
            Method::GET,
            "/v4/decodetrack",
            &[("encodedTrack", encoded.to_string())],
            None,
        )
        .await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        self.request(
            Method::POST,
            "/v4/decodetracks",
            &[],
            Some(serde_json::to_value(encoded)?),
        )
        .await
    }

    pub async fn update_session(
        &self,
        session_id: &SessionId,
        update: &SessionUpdate,
    ) -> Result<SessionInfo> {
        self.request(
            Method::PATCH,
            &format!("/v4/sessions/{session_id}"),
            &[],
            Some(serde_json::to_value(update)?),
        )
        .await
    }

    pub async fn get_player(
        &self,
        session_id: &SessionId,
        guild_id: &GuildId,
    ) -> Result<PlayerInfo> {
        self.request(
            Method::GET,
            &format!("/v4/sessions/{session_id}/players/{guild_id}"),
            &[],
            None,
        )
        .await
    }

    pub async fn get_players(&self, session_id: &SessionId) -> Result<Vec<PlayerInfo>> {
        self.request(
            Method::GET,
            &format!("/v4/sessions/{session_id}/players"),
            &[],
            None,
        )
        .await
    }

    pub async fn update_player(
        &self,
        session_id: &SessionId,
        guild_id: &GuildId,
        update: &PlayerUpdate,
        no_replace: bool,
    ) -> Result<PlayerInfo> {
        self.request(
            Method::PATCH,
            &format!("/v4/sessions/{session_id}/players/{guild_id}"),
            &[("noReplace", no_replace.to_string())],
            Some(serde_json::to_value(update)?),
        )
        .await
    }

    pub async fn destroy_player(&self, session_id: &SessionId, guild_id: &GuildId) -> Result<()> {
        let path = format!("/v4/sessions/{session_id}/players/{guild_id}");
        let response = self.send(Method::DELETE, &path, &[], None).await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(self.error_from_response(&path, response).await)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let response = self.send(method, path, query, body).await?;
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        Err(self.error_from_response(path, response).await)
    }

    /// Issue one request with the transport retry loop.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base, path);

        for attempt in 1..=self.retry_amount {
            let mut request = self.http.request(method.clone(), &url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    debug!(
                        "[{}] {} {} -> {}",
                        self.identifier,
                        method,
                        path,
                        response.status()
                    );
                    return Ok(response);
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < self.retry_amount => {
                    let delay = RETRY_STEP * attempt;
                    warn!(
                        "[{}] {} {} failed ({}), retry {}/{} in {:?}",
                        self.identifier, method, path, e, attempt, self.retry_amount, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_timeout() => {
                    return Err(Error::RestTimeout {
                        path: path.to_string(),
                        attempts: self.retry_amount,
                    });
                }
                Err(e) => return Err(Error::Http(e)),
            }
        }

        Err(Error::RestTimeout {
            path: path.to_string(),
            attempts: self.retry_amount,
        })
    }

    /// Map a non-2xx response to a typed error. A 404 on a session path means
    /// the node forgot our session; the session layer reconnects on that.
    async fn error_from_response(&self, path: &str, response: reqwest::Response) -> Error {
        let status = response.status();
        if status == StatusCode::NOT_FOUND && is_session_scoped(path) {
            return Error::SessionInvalid(self.identifier.clone());
        }

        let parsed: Option<ErrorResponse> = response.json().await.ok();
        let message = parsed
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| status.to_string());
        Error::Api {
            status: status.as_u16(),
            path: path.to_string(),
            message,
            response: parsed,
        }
    }
}

fn is_session_scoped(path: &str) -> bool {
    path.starts_with("/v4/sessions/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_scoped_paths() {
        assert!(is_session_scoped("/v4/sessions/abc/players/123"));
        assert!(is_session_scoped("/v4/sessions/abc"));
        assert!(!is_session_scoped("/v4/loadtracks"));
        assert!(!is_session_scoped("/version"));
    }

    #[test]
    fn test_retry_step_is_linear() {
        assert_eq!(RETRY_STEP * 1, Duration::from_millis(500));
        assert_eq!(RETRY_STEP * 3, Duration::from_millis(1500));
    }
}
