use crate::parser::ProviderFetcher;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Some providers only answer known client user agents; they are tried in
/// order until one gets a successful reply.
const USER_AGENTS: &[&str] = &[
    "ClashMeta/1.14.4",
    "ClashforWindows/0.20.39",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    "Clash/1.18.0",
];

pub fn is_remote(input: &str) -> bool {
    let lower = input.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Fetches subscription bodies over HTTP(S), from `file://` URLs or from
/// local paths.
#[derive(Debug, Clone)]
pub struct SubscriptionFetcher {
    client: Client,
}

impl SubscriptionFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .gzip(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub async fn fetch_subscription(&self, input: &str) -> Result<String> {
        let input = input.trim();
        if input.is_empty() {
            return Err(anyhow!("no subscription input given"));
        }
        if let Some(path) = input.strip_prefix("file://") {
            return tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path));
        }
        if !is_remote(input) {
            return tokio::fs::read_to_string(input)
                .await
                .with_context(|| format!("failed to read {}", input));
        }
        self.fetch_remote(input).await
    }

    async fn fetch_remote(&self, url: &str) -> Result<String> {
        let mut last_err = None;
        for (i, agent) in USER_AGENTS.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let response = self
                .client
                .get(url)
                .header(reqwest::header::USER_AGENT, *agent)
                .header(reqwest::header::ACCEPT, "*/*")
                .send()
                .await;
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    debug!("Fetch with user agent {} failed: {}", agent, e);
                    last_err = Some(anyhow!("Failed to fetch subscription: {}", e));
                    continue;
                }
            };
            if !response.status().is_success() {
                debug!("Fetch with user agent {} returned {}", agent, response.status());
                last_err = Some(anyhow!(
                    "Failed to fetch subscription: {}",
                    response.status()
                ));
                continue;
            }
            return response
                .text()
                .await
                .context("failed to read subscription body");
        }
        Err(last_err.unwrap_or_else(|| anyhow!("Failed to fetch subscription")))
    }
}

#[async_trait]
impl ProviderFetcher for SubscriptionFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.fetch_subscription(url).await
    }
}
