//! ArmorCode API plumbing
//!
//! Shared HTTP client for the validation, discovery and ping endpoints.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::gate::GateError;
use crate::utils::truncate::truncate_body;

pub const DEFAULT_BASE_URL: &str = "https://app.armorcode.com";
pub const BUILD_PATH: &str = "/client/build";
pub const DISCOVERY_PATH: &str = "/client/builds/jobs/discovery/monitoring";
pub const PING_PATH: &str = "/client/ping";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin wrapper over a configured [`reqwest::Client`]
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .user_agent(concat!("release-gate/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
        }
    }

    /// POST a JSON body with bearer auth and return the raw response text.
    pub async fn post_json(&self, url: &str, token: &str, body: &Value) -> Result<String, GateError> {
        debug!("POST {}", url);

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| GateError::Transport { url: url.to_string(), message: e.to_string() })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GateError::Transport { url: url.to_string(), message: e.to_string() })?;

        if !status.is_success() {
            return Err(GateError::Http {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate_body(&text),
            });
        }

        Ok(text)
    }

    /// Connectivity check. Only a 200 counts as reachable.
    pub async fn ping(&self, base_url: &str, token: Option<&str>) -> Result<bool, GateError> {
        let url = join_path(base_url, PING_PATH);
        let mut request = self.http.get(&url);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GateError::Transport { url: url.clone(), message: e.to_string() })?;

        Ok(response.status() == reqwest::StatusCode::OK)
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Join `base` and `path` with exactly one slash.
pub fn join_path(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path_strips_trailing_slashes() {
        assert_eq!(join_path("https://a.test/", PING_PATH), "https://a.test/client/ping");
        assert_eq!(join_path("https://a.test", DISCOVERY_PATH), "https://a.test/client/builds/jobs/discovery/monitoring");
    }
}
