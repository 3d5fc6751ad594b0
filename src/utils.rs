use std::future::Future;

use tokio::sync::watch;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

impl RetryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            backoff_multiplier: 2,
        }
    }
}

/// Runs `operation` up to `config.max_attempts` times with jittered
/// exponential backoff, reporting how many attempts were made.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    info!(attempts, "Retry succeeded");
                }
                return (Ok(value), attempts);
            }
            Err(e) => {
                if attempts >= config.max_attempts {
                    warn!(
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return (Err(e), attempts);
                }

                debug!(attempts, delay_ms, error = %e, "Attempt failed, backing off");

                let jitter = rand::random_range(-0.1..=0.1);
                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = std::cmp::min(delay_ms * config.backoff_multiplier, config.max_delay_ms);
            }
        }
    }
}

/// Watch channel flipped to `true` on SIGINT or SIGTERM. Every long-running
/// loop takes a receiver instead of consulting shared flags.
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (sender, receiver) = watch::channel(false);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!(error = %e, "Failed to install SIGTERM handler");
                        return;
                    }
                };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt, shutting down");
        }

        let _ = sender.send(true);
    });

    receiver
}
