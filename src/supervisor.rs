use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, interval, timeout};
use tracing::{error, info, warn};

use crate::{
    config::QueueConfig,
    models::health::{HealthReport, HealthStatus, WorkerHealth},
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// How long a worker gets to drain after a graceful terminate.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

struct WorkerRecord {
    queue: String,
    concurrency: usize,
    child: Child,
}

impl WorkerRecord {
    fn name(&self) -> String {
        format!("worker-{}", self.queue)
    }
}

/// Starts one worker process per queue, replaces the dead, and tears
/// everything down on shutdown. Restarts are unconditional and unbounded;
/// a crash-looping worker keeps coming back. Never touches queues or mail
/// itself.
pub struct Supervisor {
    queues: Vec<QueueConfig>,
    worker_command: Vec<String>,
    poll_interval: Duration,
    workers: Mutex<Vec<WorkerRecord>>,
}

impl Supervisor {
    pub fn new(queues: Vec<QueueConfig>) -> Result<Self, Error> {
        let exe = std::env::current_exe()
            .map_err(|e| anyhow!("Cannot determine the current executable: {e}"))?;

        Ok(Self::with_command(
            queues,
            vec![exe.to_string_lossy().into_owned(), "worker".to_string()],
        ))
    }

    /// Worker command override: `<queue> <concurrency>` is appended per queue.
    pub fn with_command(queues: Vec<QueueConfig>, worker_command: Vec<String>) -> Self {
        Self {
            queues,
            worker_command,
            poll_interval: DEFAULT_POLL_INTERVAL,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn spawn_worker(&self, queue: &QueueConfig) -> Result<Child, Error> {
        let (program, args) = self
            .worker_command
            .split_first()
            .ok_or_else(|| anyhow!("Worker command is empty"))?;

        let child = Command::new(program)
            .args(args)
            .arg(&queue.name)
            .arg(queue.concurrency.to_string())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn worker for queue {}: {e}", queue.name))?;

        info!(
            queue = %queue.name,
            pid = child.id(),
            concurrency = queue.concurrency,
            "Worker process started"
        );

        Ok(child)
    }

    pub async fn start(&self) -> Result<(), Error> {
        let mut workers = self.workers.lock().await;

        for queue in &self.queues {
            match self.spawn_worker(queue) {
                Ok(child) => workers.push(WorkerRecord {
                    queue: queue.name.clone(),
                    concurrency: queue.concurrency,
                    child,
                }),
                Err(e) => {
                    // A partial start must not leave earlier workers orphaned.
                    error!(queue = %queue.name, error = %e, "Startup failed, stopping started workers");
                    drop(workers);
                    self.shutdown_workers().await;
                    return Err(e);
                }
            }
        }

        info!(total = workers.len(), "Mail service started");
        Ok(())
    }

    /// Liveness loop: replace dead workers every poll interval until shutdown
    /// is signalled, then terminate everything gracefully.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        self.start().await?;

        let mut ticker = interval(self.poll_interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.reap_and_restart().await,
            }
        }

        self.shutdown_workers().await;
        Ok(())
    }

    async fn reap_and_restart(&self) {
        let mut workers = self.workers.lock().await;

        for record in workers.iter_mut() {
            let exit = match record.child.try_wait() {
                Ok(None) => continue,
                Ok(Some(status)) => status,
                Err(e) => {
                    error!(queue = %record.queue, error = %e, "Failed to poll worker");
                    continue;
                }
            };

            warn!(
                queue = %record.queue,
                name = %record.name(),
                exitcode = exit.code(),
                "Worker process died"
            );

            // Unconditional replacement, no backoff.
            let queue = QueueConfig {
                name: record.queue.clone(),
                concurrency: record.concurrency,
            };

            match self.spawn_worker(&queue) {
                Ok(child) => {
                    record.child = child;
                    info!(
                        queue = %record.queue,
                        pid = record.child.id(),
                        "Worker restarted"
                    );
                }
                Err(e) => {
                    error!(queue = %record.queue, error = %e, "Failed to restart worker");
                }
            }
        }
    }

    async fn shutdown_workers(&self) {
        let mut workers = self.workers.lock().await;

        info!(total = workers.len(), "Stopping mail service");

        for record in workers.iter_mut() {
            terminate(&mut record.child, &record.queue);
        }

        for record in workers.iter_mut() {
            match timeout(SHUTDOWN_TIMEOUT, record.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(queue = %record.queue, exitcode = status.code(), "Worker exited");
                }
                Ok(Err(e)) => {
                    error!(queue = %record.queue, error = %e, "Failed waiting for worker");
                }
                Err(_) => {
                    warn!(queue = %record.queue, "Worker ignored terminate, force killing");
                    if let Err(e) = record.child.kill().await {
                        error!(queue = %record.queue, error = %e, "Failed to kill worker");
                    }
                }
            }
        }

        workers.clear();
        info!("Mail service stopped");
    }

    pub async fn health_check(&self) -> HealthReport {
        let mut workers = self.workers.lock().await;

        let mut processes = Vec::with_capacity(workers.len());
        for record in workers.iter_mut() {
            let exit = record.child.try_wait().ok().flatten();
            processes.push(WorkerHealth {
                name: record.name(),
                pid: record.child.id(),
                alive: exit.is_none(),
                exitcode: exit.and_then(|status| status.code()),
            });
        }

        let alive = processes.iter().filter(|process| process.alive).count();

        HealthReport {
            status: if alive == processes.len() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            timestamp: Utc::now(),
            total_processes: processes.len(),
            alive_processes: alive,
            processes,
        }
    }
}

/// Graceful terminate: SIGTERM on unix so the worker can drain its in-flight
/// messages, plain kill elsewhere.
fn terminate(child: &mut Child, queue: &str) {
    let Some(pid) = child.id() else {
        return;
    };

    #[cfg(unix)]
    {
        info!(queue, pid, "Sending SIGTERM to worker");
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        info!(queue, pid, "Killing worker");
        let _ = child.start_kill();
    }
}
