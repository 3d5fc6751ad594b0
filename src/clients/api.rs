use anyhow::{Error, Result, anyhow};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::clients::token::TokenHandle;

/// Bearer-authenticated client for the recipient-lookup API. A 401 response
/// forces a token refresh and retries the request, bounded by `max_retries`.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    tokens: TokenHandle,
    max_retries: u32,
}

impl ApiClient {
    pub fn new(base_url: &str, tokens: TokenHandle, max_retries: u32) -> Result<Self, Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            max_retries,
        })
    }

    pub async fn get(&self, path: &str) -> Result<Value, Error> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut retries = 0;

        loop {
            let token = self.tokens.token().await?;

            let response = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| anyhow!("GET {url} failed: {e}"))?;

            if response.status() == StatusCode::UNAUTHORIZED && retries < self.max_retries {
                retries += 1;
                warn!(%url, retries, "Received 401, refreshing token and retrying");
                self.tokens.invalidate().await?;
                continue;
            }

            let response = response
                .error_for_status()
                .map_err(|e| anyhow!("GET {url} returned an error status: {e}"))?;

            debug!(%url, status = response.status().as_u16(), "API request completed");

            return response
                .json::<Value>()
                .await
                .map_err(|e| anyhow!("GET {url} returned unparseable JSON: {e}"));
        }
    }
}
