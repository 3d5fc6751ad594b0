use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

/// A token is treated as expired this long before its nominal expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The scheduled refresh fires once the token has less than this long left.
const REFRESH_LEAD_SECS: i64 = 300;

/// Minimum sleep between scheduled refresh checks.
const MIN_REFRESH_WAIT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct TokenState {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
}

impl TokenState {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS)
    }

    pub fn expires_in_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

#[derive(Deserialize, Default)]
struct LoginBody {
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

enum TokenRequest {
    /// Current access token, refreshing first if absent or expired.
    Fetch(oneshot::Sender<Result<String, Error>>),
    /// Drop the held token and log in again (the 401 recovery path).
    Invalidate(oneshot::Sender<Result<String, Error>>),
}

/// Cloneable handle to the token actor.
#[derive(Clone)]
pub struct TokenHandle {
    requests: mpsc::Sender<TokenRequest>,
}

impl TokenHandle {
    pub async fn token(&self) -> Result<String, Error> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(TokenRequest::Fetch(reply))
            .await
            .map_err(|_| anyhow!("Token manager is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("Token manager dropped the request"))?
    }

    pub async fn invalidate(&self) -> Result<String, Error> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(TokenRequest::Invalidate(reply))
            .await
            .map_err(|_| anyhow!("Token manager is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("Token manager dropped the request"))?
    }
}

/// Owns the token state on a dedicated task. Callers talk to it through a
/// [`TokenHandle`]; the actor serializes refreshes, so concurrent callers of
/// an expired token trigger exactly one login call. The same loop performs
/// the scheduled background refresh.
pub struct TokenManager {
    base_url: String,
    client_id: String,
    client_secret: String,
    default_ttl_secs: i64,
    http: Client,
    token: Option<TokenState>,
}

impl TokenManager {
    pub fn spawn(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
        default_ttl_secs: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Result<TokenHandle, Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {e}"))?;

        let mut manager = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            default_ttl_secs: default_ttl_secs as i64,
            http,
            token: None,
        };

        let (requests, receiver) = mpsc::channel(16);
        tokio::spawn(async move { manager.run(receiver, shutdown).await });

        Ok(TokenHandle { requests })
    }

    async fn run(
        &mut self,
        mut requests: mpsc::Receiver<TokenRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let wait = match &self.token {
                Some(token) => Duration::from_secs(
                    (token.expires_in_seconds() - REFRESH_LEAD_SECS)
                        .max(MIN_REFRESH_WAIT_SECS as i64) as u64,
                ),
                None => Duration::from_secs(MIN_REFRESH_WAIT_SECS),
            };

            tokio::select! {
                _ = shutdown.changed() => break,

                request = requests.recv() => match request {
                    None => break,
                    Some(TokenRequest::Fetch(reply)) => {
                        let _ = reply.send(self.fresh_token().await);
                    }
                    Some(TokenRequest::Invalidate(reply)) => {
                        self.token = None;
                        let _ = reply.send(self.fresh_token().await);
                    }
                },

                _ = sleep(wait) => {
                    // Re-check: a caller-triggered refresh may have replaced
                    // the token since this sleep began.
                    let near_expiry = self
                        .token
                        .as_ref()
                        .is_some_and(|t| t.expires_in_seconds() <= REFRESH_LEAD_SECS);

                    if near_expiry {
                        info!("Refreshing access token on schedule");
                        if let Err(e) = self.refresh().await {
                            warn!(error = %e, "Scheduled token refresh failed, will retry");
                        }
                    }
                }
            }
        }

        info!("Token manager stopped");
    }

    async fn fresh_token(&mut self) -> Result<String, Error> {
        match &self.token {
            Some(token) if !token.is_expired() => Ok(token.access_token.clone()),
            _ => self.refresh().await,
        }
    }

    /// Performs the login call and replaces the held token wholesale.
    async fn refresh(&mut self) -> Result<String, Error> {
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .json(&serde_json::json!({
                "email": self.client_id,
                "password": self.client_secret,
            }))
            .send()
            .await
            .map_err(|e| anyhow!("Login request failed: {e}"))?
            .error_for_status()
            .map_err(|e| anyhow!("Login rejected: {e}"))?;

        let access_token = response
            .headers()
            .get("Authentication")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Login response is missing the 'Authentication' header"))?;

        // The body is optional; fall back to the configured TTL when it is
        // absent or unparseable.
        let body = response.json::<LoginBody>().await.unwrap_or_default();

        let expires_in = body.expires_in.unwrap_or(self.default_ttl_secs);
        let expires_at = Utc::now() + ChronoDuration::seconds(expires_in);

        self.token = Some(TokenState {
            access_token: access_token.clone(),
            expires_at,
            refresh_token: body.refresh_token,
        });

        info!(%expires_at, "Access token refreshed");

        Ok(access_token)
    }
}
