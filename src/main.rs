use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mail_service::{api, config::Config, supervisor::Supervisor, utils, worker::WorkerEngine};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;
    let shutdown = utils::shutdown_channel();
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        // Spawned by the supervisor: one isolated process per queue.
        Some("worker") => {
            let queue_name = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: mail_service worker <queue> <concurrency>"))?
                .clone();

            let concurrency = args
                .get(3)
                .map(|raw| raw.parse::<usize>())
                .transpose()
                .map_err(|e| anyhow!("Invalid concurrency: {e}"))?
                .unwrap_or(5)
                .max(1);

            let engine = WorkerEngine::new(config, queue_name, concurrency, &shutdown)?;
            engine.run(shutdown).await
        }

        None => {
            info!("Starting mail service");

            let supervisor = Arc::new(Supervisor::new(config.queue_configs()?)?);

            let health = Arc::clone(&supervisor);
            let health_port = config.health_port;
            tokio::spawn(async move {
                if let Err(e) = api::run_health_server(health, health_port).await {
                    error!(error = %e, "Health endpoint stopped");
                }
            });

            supervisor.run(shutdown).await
        }

        Some(other) => Err(anyhow!("Unknown command: {other}")),
    }
}
