use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use futures_util::StreamExt;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, timeout};
use tracing::{error, info, warn};

use crate::{
    clients::{
        api::ApiClient,
        rabbitmq::{MessageSettlement, RabbitMqClient},
        smtp::{MailTransport, SmtpMailer},
        token::TokenManager,
    },
    config::Config,
    delivery::Mailer,
    error::ProcessError,
    models::{job::EmailJob, outcome::JobVerdict},
    resolver::RecipientResolver,
    templates::TemplateStore,
    utils::RetryConfig,
};

/// How long to wait for each outstanding message when shutting down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns one parsed job into a verdict: resolve recipients, render the
/// template, hand off to the delivery policy. Never touches the broker.
pub struct MessageProcessor<T> {
    resolver: RecipientResolver,
    templates: TemplateStore,
    mailer: Mailer<T>,
    queue_name: String,
}

impl<T: MailTransport> MessageProcessor<T> {
    pub fn new(
        resolver: RecipientResolver,
        templates: TemplateStore,
        mailer: Mailer<T>,
        queue_name: String,
    ) -> Self {
        Self {
            resolver,
            templates,
            mailer,
            queue_name,
        }
    }

    pub async fn process(&self, job: EmailJob) -> JobVerdict {
        match self.try_process(job).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(queue = %self.queue_name, error = %e, "Message processing failed");
                JobVerdict::failure(e.to_string(), e.requeue())
            }
        }
    }

    async fn try_process(&self, job: EmailJob) -> Result<JobVerdict, ProcessError> {
        let recipients = self.resolver.resolve(&job).await;
        if recipients.is_empty() {
            return Err(ProcessError::NoRecipients);
        }

        let template_name = job.template_name.as_deref().unwrap_or(&self.queue_name);
        let html = self.templates.render(template_name, &job.context)?;

        let outcome = self
            .mailer
            .deliver(
                &recipients,
                &job.subject,
                &html,
                job.use_bcc,
                job.bcc_batch_size,
            )
            .await;

        let verdict = outcome.verdict();

        if verdict.success {
            info!(queue = %self.queue_name, message = %verdict.message, "Job delivered");
        } else {
            error!(queue = %self.queue_name, message = %verdict.message, "Job delivery failed");
        }

        Ok(verdict)
    }
}

/// A dispatched processing task, keyed by its delivery tag until the drive
/// loop observes its verdict.
struct InFlightUnit {
    enqueued_at: Instant,
    task: JoinHandle<()>,
}

/// Tracks dispatched work by delivery tag and makes every ack/reject call.
/// Exactly one ledger exists per drive loop; processing tasks report verdicts
/// over the completion channel but never settle anything themselves.
struct InFlightLedger {
    queue_name: String,
    units: HashMap<u64, InFlightUnit>,
}

impl InFlightLedger {
    fn new(queue_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            units: HashMap::new(),
        }
    }

    fn track(&mut self, delivery_tag: u64, task: JoinHandle<()>) {
        self.units.insert(
            delivery_tag,
            InFlightUnit {
                enqueued_at: Instant::now(),
                task,
            },
        );
    }

    async fn settle<B: MessageSettlement>(
        &mut self,
        broker: &B,
        delivery_tag: u64,
        verdict: JobVerdict,
    ) -> Result<(), Error> {
        let Some(unit) = self.units.remove(&delivery_tag) else {
            warn!(delivery_tag, "Completion for an unknown delivery tag");
            return Ok(());
        };

        let elapsed_ms = unit.enqueued_at.elapsed().as_millis() as u64;

        if verdict.success {
            broker.acknowledge(delivery_tag).await?;
            info!(queue = %self.queue_name, delivery_tag, elapsed_ms, "Message acknowledged");
        } else {
            broker.reject(delivery_tag, verdict.requeue).await?;
            warn!(
                queue = %self.queue_name,
                delivery_tag,
                elapsed_ms,
                requeue = verdict.requeue,
                message = %verdict.message,
                "Message rejected"
            );
        }

        Ok(())
    }

    /// Waits for outstanding tasks within the window; whatever cannot finish
    /// is aborted and goes back to the queue.
    async fn drain<B: MessageSettlement>(
        &mut self,
        broker: &B,
        done_rx: &mut mpsc::UnboundedReceiver<(u64, JobVerdict)>,
        window: Duration,
    ) {
        if self.units.is_empty() {
            return;
        }

        info!(
            queue = %self.queue_name,
            outstanding = self.units.len(),
            "Draining in-flight messages"
        );

        while !self.units.is_empty() {
            match timeout(window, done_rx.recv()).await {
                Ok(Some((delivery_tag, verdict))) => {
                    if let Err(e) = self.settle(broker, delivery_tag, verdict).await {
                        error!(error = %e, "Failed to settle message during drain");
                        break;
                    }
                }
                _ => break,
            }
        }

        for (delivery_tag, unit) in self.units.drain() {
            warn!(
                queue = %self.queue_name,
                delivery_tag,
                "Message did not complete before shutdown, requeueing"
            );
            unit.task.abort();

            if let Err(e) = broker.reject(delivery_tag, true).await {
                error!(delivery_tag, error = %e, "Failed to requeue message");
            }
        }
    }
}

/// Parses one delivery on the drive loop and either rejects it outright or
/// hands it to the bounded task pool. Malformed payloads never reach the pool.
async fn dispatch<B, T>(
    broker: &B,
    ledger: &mut InFlightLedger,
    processor: &Arc<MessageProcessor<T>>,
    semaphore: &Arc<Semaphore>,
    done_tx: &mpsc::UnboundedSender<(u64, JobVerdict)>,
    delivery_tag: u64,
    payload: &[u8],
) -> Result<(), Error>
where
    B: MessageSettlement,
    T: MailTransport + 'static,
{
    let job = match EmailJob::parse(payload) {
        Ok(job) => job,
        Err(e) => {
            warn!(
                queue = %ledger.queue_name,
                delivery_tag,
                error = %e,
                "Rejecting malformed message"
            );
            return broker.reject(delivery_tag, false).await;
        }
    };

    let processor = Arc::clone(processor);
    let semaphore = Arc::clone(semaphore);
    let done_tx = done_tx.clone();

    let task = tokio::spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };
        let verdict = processor.process(job).await;
        let _ = done_tx.send((delivery_tag, verdict));
    });

    ledger.track(delivery_tag, task);
    Ok(())
}

/// Per-queue engine. One broker connection owned by a single drive loop, a
/// bounded pool of processing tasks, and a completion channel correlating
/// finished work back to ack/reject decisions. Acknowledgment happens only
/// on the drive loop; processing tasks never see the channel.
pub struct WorkerEngine {
    config: Config,
    queue_name: String,
    concurrency: usize,
    processor: Arc<MessageProcessor<SmtpMailer>>,
}

impl WorkerEngine {
    pub fn new(
        config: Config,
        queue_name: String,
        concurrency: usize,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Self, Error> {
        let tokens = TokenManager::spawn(
            &config.api_base_url,
            &config.api_client_id,
            &config.api_client_secret,
            config.api_token_duration,
            shutdown.clone(),
        )?;

        let api = ApiClient::new(&config.api_base_url, tokens, config.max_retries)?;
        let resolver = RecipientResolver::new(api);
        let templates = TemplateStore::load(&config.template_dir)?;
        let mailer = Mailer::new(SmtpMailer::new(&config)?, RetryConfig::from_config(&config));

        let processor = Arc::new(MessageProcessor::new(
            resolver,
            templates,
            mailer,
            queue_name.clone(),
        ));

        Ok(Self {
            config,
            queue_name,
            concurrency,
            processor,
        })
    }

    /// Outer reconnect loop: any connection-level failure tears the channel
    /// down and rebuilds it from scratch after the configured delay, until
    /// shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        info!(
            queue = %self.queue_name,
            concurrency = self.concurrency,
            pid = std::process::id(),
            "Worker started"
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.consume(&mut shutdown).await {
                if *shutdown.borrow() {
                    break;
                }

                error!(queue = %self.queue_name, error = %e, "Consumer failed");
                info!(
                    delay_secs = self.config.retry_delay_secs,
                    "Reconnecting after delay"
                );

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(Duration::from_secs(self.config.retry_delay_secs)) => {}
                }
            }
        }

        info!(queue = %self.queue_name, "Worker stopped cleanly");
        Ok(())
    }

    async fn consume(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), Error> {
        // Lookahead without unbounded buffering.
        let prefetch = (self.concurrency * 2).min(u16::MAX as usize) as u16;

        let client =
            RabbitMqClient::connect(&self.config.rabbitmq_url, &self.queue_name, prefetch).await?;

        let consumer_tag = format!("mail-worker-{}", std::process::id());
        let mut deliveries = client.create_consumer(&consumer_tag).await?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(u64, JobVerdict)>();
        let mut ledger = InFlightLedger::new(&self.queue_name);

        info!(queue = %self.queue_name, prefetch, "Listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                Some((delivery_tag, verdict)) = done_rx.recv() => {
                    ledger.settle(&client, delivery_tag, verdict).await?;
                }

                delivery = deliveries.next() => {
                    let delivery = match delivery {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => return Err(anyhow!("Consumer stream failed: {e}")),
                        None => return Err(anyhow!("Consumer stream closed by the broker")),
                    };

                    dispatch(
                        &client,
                        &mut ledger,
                        &self.processor,
                        &semaphore,
                        &done_tx,
                        delivery.delivery_tag,
                        &delivery.data,
                    )
                    .await?;
                }
            }
        }

        ledger.drain(&client, &mut done_rx, DRAIN_TIMEOUT).await;
        client.close().await
    }
}
