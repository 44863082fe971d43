//! Client for the engine's control API.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::error::{EngineStartupError, NetworkError};
use crate::parser::query::{path_escape, query_escape};

const READY_REQUEST_TIMEOUT: Duration = Duration::from_millis(1200);
const API_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct DelayResponse {
    #[serde(default)]
    delay: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
pub struct Controller {
    base: String,
    client: Client,
    ready_client: Client,
}

impl Controller {
    /// `probe_timeout` is the per-attempt timeout; API calls get two extra
    /// seconds on top of it.
    pub fn new(base: impl Into<String>, probe_timeout: Duration) -> Result<Self, EngineStartupError> {
        let client = Client::builder()
            .no_proxy()
            .timeout(probe_timeout + API_GRACE)
            .pool_max_idle_per_host(64)
            .build()
            .map_err(|e| EngineStartupError::Io(e.to_string()))?;
        let ready_client = Client::builder()
            .no_proxy()
            .timeout(READY_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineStartupError::Io(e.to_string()))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
            ready_client,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Readiness probe.
    pub async fn version(&self) -> Result<(), NetworkError> {
        let response = self
            .ready_client
            .get(format!("{}/version", self.base))
            .send()
            .await
            .map_err(|e| NetworkError::Api(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(NetworkError::Api(response.status().to_string()))
        }
    }

    pub async fn delay(
        &self,
        proxy: &str,
        test_url: &str,
        timeout: Duration,
    ) -> Result<Duration, NetworkError> {
        let url = delay_url(&self.base, proxy, test_url, timeout);
        let response = self.client.get(url).send().await.map_err(map_request_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_request_error)?;
        parse_delay_response(status, &body)
    }

    pub async fn select(&self, group: &str, proxy: &str) -> Result<(), NetworkError> {
        let response = self
            .client
            .put(format!("{}/proxies/{}", self.base, path_escape(group)))
            .json(&json!({ "name": proxy }))
            .send()
            .await
            .map_err(map_request_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(NetworkError::Api(format!("select {proxy}: {}", response.status())))
        }
    }
}

fn map_request_error(e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout
    } else {
        NetworkError::Api(e.to_string())
    }
}

pub fn delay_url(base: &str, proxy: &str, test_url: &str, timeout: Duration) -> String {
    let timeout = if timeout.is_zero() {
        Duration::from_secs(5)
    } else {
        timeout
    };
    format!(
        "{}/proxies/{}/delay?timeout={}&url={}",
        base,
        path_escape(proxy),
        timeout.as_millis(),
        query_escape(test_url)
    )
}

/// Interprets a delay API reply. Non-positive delays are failures carrying
/// the engine's message.
pub fn parse_delay_response(status: StatusCode, body: &str) -> Result<Duration, NetworkError> {
    if !status.is_success() {
        let message = match body.trim() {
            "" => status.to_string(),
            text => text.to_string(),
        };
        return Err(NetworkError::Api(format!("delay API error: {message}")));
    }
    let reply: DelayResponse =
        serde_json::from_str(body).map_err(|e| NetworkError::Api(e.to_string()))?;
    if reply.delay <= 0 {
        return Err(NetworkError::Delay(match reply.message.trim() {
            "" => "invalid delay".to_string(),
            message => message.to_string(),
        }));
    }
    Ok(Duration::from_millis(reply.delay as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_url_escaping() {
        let url = delay_url(
            "http://127.0.0.1:9090",
            "HK 01/a",
            "https://www.gstatic.com/generate_204",
            Duration::from_millis(1500),
        );
        assert_eq!(
            url,
            "http://127.0.0.1:9090/proxies/HK%2001%2Fa/delay?timeout=1500&url=https%3A%2F%2Fwww.gstatic.com%2Fgenerate_204"
        );
    }

    #[test]
    fn test_parse_delay_response() {
        assert_eq!(
            parse_delay_response(StatusCode::OK, r#"{"delay": 123}"#),
            Ok(Duration::from_millis(123))
        );
        assert_eq!(
            parse_delay_response(StatusCode::OK, r#"{"delay": 0, "message": "timeout"}"#),
            Err(NetworkError::Delay("timeout".into()))
        );
        assert_eq!(
            parse_delay_response(StatusCode::OK, r#"{"delay": -1}"#),
            Err(NetworkError::Delay("invalid delay".into()))
        );
        assert_eq!(
            parse_delay_response(StatusCode::SERVICE_UNAVAILABLE, ""),
            Err(NetworkError::Api("delay API error: 503 Service Unavailable".into()))
        );
        assert!(parse_delay_response(StatusCode::OK, "not json").is_err());
    }
}
