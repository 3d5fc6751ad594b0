use anyhow::Result;
use mail_service::config::Config;
use mail_service::worker::WorkerEngine;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::{Duration, sleep, timeout};

fn config(template_dir: &TempDir) -> Config {
    Config {
        // Nothing listens here; every connect attempt fails fast.
        rabbitmq_url: "amqp://127.0.0.1:1".to_string(),
        api_base_url: "http://127.0.0.1:1".to_string(),
        api_client_id: "client".to_string(),
        api_client_secret: "secret".to_string(),
        api_token_duration: 1800,
        smtp_host: "127.0.0.1".to_string(),
        smtp_port: 587,
        smtp_user: "mailer@example.com".to_string(),
        smtp_password: "password".to_string(),
        smtp_use_tls: false,
        queues: "welcome".to_string(),
        queue_workers: "2".to_string(),
        max_retries: 1,
        retry_delay_secs: 600,
        template_dir: template_dir.path().to_string_lossy().into_owned(),
        health_port: 0,
    }
}

/// Test: a stop signal during a broker outage is observed immediately instead
/// of waiting out the reconnect delay
#[tokio::test]
async fn shutdown_interrupts_the_reconnect_delay() -> Result<()> {
    let template_dir = TempDir::new()?;
    std::fs::write(template_dir.path().join("welcome.html"), "<p>hi</p>")?;

    let (shutdown_tx, shutdown) = watch::channel(false);
    let engine = WorkerEngine::new(config(&template_dir), "welcome".to_string(), 2, &shutdown)?;

    let runner = tokio::spawn(async move { engine.run(shutdown).await });

    // Let the engine fail its first connect and enter the 600s delay.
    sleep(Duration::from_millis(500)).await;
    shutdown_tx.send(true)?;

    timeout(Duration::from_secs(5), runner).await???;
    Ok(())
}
