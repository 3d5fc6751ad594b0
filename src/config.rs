use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,

    pub api_base_url: String,
    pub api_client_id: String,
    pub api_client_secret: String,
    #[serde(default = "default_token_duration")]
    pub api_token_duration: u64,

    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    #[serde(default = "default_smtp_use_tls")]
    pub smtp_use_tls: bool,

    /// Comma-separated queue names, paired with `queue_workers`.
    pub queues: String,
    /// Comma-separated per-queue concurrency, same length as `queues`.
    pub queue_workers: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_token_duration() -> u64 {
    1800
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_use_tls() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_template_dir() -> String {
    "templates".to_string()
}

fn default_health_port() -> u16 {
    8080
}

/// One queue to consume, with its worker-pool size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environment variable: {e}"))?;

        // Fail fast on a malformed queue list, before any queue is opened.
        config.queue_configs()?;

        Ok(config)
    }

    /// Pairs up the `QUEUES` and `QUEUE_WORKERS` comma lists.
    pub fn queue_configs(&self) -> Result<Vec<QueueConfig>, Error> {
        let names: Vec<&str> = self
            .queues
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        let workers = self
            .queue_workers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|e| anyhow!("Invalid queue worker count '{s}': {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if names.is_empty() {
            return Err(anyhow!("QUEUES cannot be empty"));
        }

        if names.len() != workers.len() {
            return Err(anyhow!("QUEUES and QUEUE_WORKERS must have the same length"));
        }

        Ok(names
            .into_iter()
            .zip(workers)
            .map(|(name, concurrency)| QueueConfig {
                name: name.to_string(),
                concurrency: concurrency.max(1),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_queues(queues: &str, queue_workers: &str) -> Config {
        Config {
            rabbitmq_url: "amqp://localhost:5672".to_string(),
            api_base_url: "http://localhost:8080".to_string(),
            api_client_id: "client".to_string(),
            api_client_secret: "secret".to_string(),
            api_token_duration: 1800,
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_user: "mailer@example.com".to_string(),
            smtp_password: "password".to_string(),
            smtp_use_tls: false,
            queues: queues.to_string(),
            queue_workers: queue_workers.to_string(),
            max_retries: 3,
            retry_delay_secs: 5,
            template_dir: "templates".to_string(),
            health_port: 8080,
        }
    }

    /// Test: the queue lists pair up name-for-count, trimming whitespace
    #[test]
    fn queue_configs_pair_names_with_worker_counts() {
        let config = config_with_queues("welcome, reminders", "4, 2");
        let queues = config.queue_configs().unwrap();

        assert_eq!(
            queues,
            vec![
                QueueConfig {
                    name: "welcome".to_string(),
                    concurrency: 4
                },
                QueueConfig {
                    name: "reminders".to_string(),
                    concurrency: 2
                },
            ]
        );
    }

    /// Test: an empty queue list is a startup error
    #[test]
    fn empty_queue_list_is_rejected() {
        let config = config_with_queues("", "");
        assert!(config.queue_configs().is_err());
    }

    /// Test: mismatched list lengths are a startup error
    #[test]
    fn mismatched_list_lengths_are_rejected() {
        let config = config_with_queues("welcome,reminders", "4");
        assert!(config.queue_configs().is_err());
    }

    /// Test: a zero worker count is clamped to one
    #[test]
    fn zero_concurrency_is_clamped() {
        let config = config_with_queues("welcome", "0");
        assert_eq!(config.queue_configs().unwrap()[0].concurrency, 1);
    }
}
