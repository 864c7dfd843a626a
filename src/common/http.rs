use std::time::Duration;

use reqwest::{
    Client, Error,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};

/// Wall-clock cap for a single REST attempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpClient;

impl HttpClient {
    pub const USER_AGENT: &'static str =
        concat!("ferrolink/", env!("CARGO_PKG_VERSION"));

    /// Build a client pre-authorized against one audio node.
    ///
    /// The password travels in the `Authorization` header on every request,
    /// so callers never handle credentials after construction.
    pub fn for_node(password: &str) -> Result<Client, Error> {
        let mut headers = HeaderMap::new();
        if let Ok(mut value) = HeaderValue::from_str(password) {
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Client::builder()
            .user_agent(Self::USER_AGENT)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
    }
}
