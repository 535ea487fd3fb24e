use async_trait::async_trait;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::FixtureProvider;
use crate::error::FetchError;

/// Bulk-query client for the Squiggle API.
/// Docs: <https://api.squiggle.com.au/>
#[derive(Clone)]
pub struct SquiggleClient {
    http: Client,
    base_url: String,
    user_agent: String,
}

impl SquiggleClient {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(SquiggleClient {
            http,
            base_url: normalize_base_url(base_url)?,
            user_agent: user_agent.to_string(),
        })
    }

    fn games_url(&self, year: i32, round: Option<i32>) -> String {
        match round {
            Some(round) => format!("{}/?q=games;year={};round={}", self.base_url, year, round),
            None => format!("{}/?q=games;year={}", self.base_url, year),
        }
    }

    async fn get(&self, url: String) -> Result<String, FetchError> {
        debug!("Fetching {}", url);

        let resp = self
            .http
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .header(header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|source| FetchError::Transport { url: url.clone(), source })?;

        if !resp.status().is_success() {
            return Err(FetchError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }

        resp.text()
            .await
            .map_err(|source| FetchError::Transport { url, source })
    }
}

#[async_trait]
impl FixtureProvider for SquiggleClient {
    fn name(&self) -> &str {
        "Squiggle"
    }

    async fn fetch_by_year(&self, year: i32) -> Result<String, FetchError> {
        self.get(self.games_url(year, None)).await
    }

    async fn fetch_by_year_and_round(&self, year: i32, round: i32) -> Result<String, FetchError> {
        self.get(self.games_url(year, Some(round))).await
    }
}

/// Validate the provider base URL and strip any trailing slash so paths can
/// be appended verbatim.
pub fn normalize_base_url(base_url: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(base_url)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("provider URL must be http(s), got {}", parsed.scheme());
    }
    Ok(base_url.trim_end_matches('/').to_string())
}
