use tracing::{error, info};

use crate::{
    clients::smtp::MailTransport,
    models::outcome::{BulkSend, DeliveryMethod, SendOutcome, SingleSend},
    utils::{RetryConfig, retry_with_backoff},
};

/// Recipient count above which a job that asks for BCC is actually batched;
/// smaller jobs fall back to individual sends.
const BCC_MIN_RECIPIENTS: usize = 10;

/// Delivery policy over a [`MailTransport`]: picks single, individual, or
/// batched-BCC sending, retries each transport call, and aggregates partial
/// results.
pub struct Mailer<T> {
    transport: T,
    retry: RetryConfig,
}

impl<T: MailTransport> Mailer<T> {
    pub fn new(transport: T, retry: RetryConfig) -> Self {
        Self { transport, retry }
    }

    pub async fn deliver(
        &self,
        recipients: &[String],
        subject: &str,
        html: &str,
        use_bcc: bool,
        bcc_batch_size: usize,
    ) -> SendOutcome {
        match recipients {
            [single] => SendOutcome::Single(self.send_single(single, subject, html).await),
            _ if use_bcc && recipients.len() > BCC_MIN_RECIPIENTS => SendOutcome::Bulk(
                self.send_bcc(recipients, subject, html, bcc_batch_size.max(1))
                    .await,
            ),
            _ => SendOutcome::Bulk(self.send_individual(recipients, subject, html).await),
        }
    }

    async fn send_single(&self, recipient: &str, subject: &str, html: &str) -> SingleSend {
        let (result, attempts) = retry_with_backoff(&self.retry, || {
            self.transport.send(recipient, &[], subject, html)
        })
        .await;

        match result {
            Ok(()) => {
                info!(recipient, attempts, "Email sent");
                SingleSend {
                    success: true,
                    message: "Email sent successfully".to_string(),
                    recipient: recipient.to_string(),
                    attempts,
                }
            }
            Err(e) => {
                error!(recipient, attempts, error = %e, "Email failed");
                SingleSend {
                    success: false,
                    message: format!("Failed after {attempts} attempts: {e}"),
                    recipient: recipient.to_string(),
                    attempts,
                }
            }
        }
    }

    async fn send_individual(&self, recipients: &[String], subject: &str, html: &str) -> BulkSend {
        info!(recipients = recipients.len(), "Sending individual emails");

        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            results.push(self.send_single(recipient, subject, html).await);
        }

        aggregate(results, DeliveryMethod::Individual)
    }

    async fn send_bcc(
        &self,
        recipients: &[String],
        subject: &str,
        html: &str,
        batch_size: usize,
    ) -> BulkSend {
        info!(
            recipients = recipients.len(),
            batch_size, "Sending BCC batches"
        );

        let mut results = Vec::with_capacity(recipients.len());

        for (index, batch) in recipients.chunks(batch_size).enumerate() {
            let batch_number = index + 1;

            // The visible To is the sender; recipients ride in BCC.
            let (result, attempts) = retry_with_backoff(&self.retry, || {
                self.transport
                    .send(self.transport.sender(), batch, subject, html)
            })
            .await;

            match result {
                Ok(()) => {
                    info!(batch = batch_number, size = batch.len(), "BCC batch sent");
                    results.extend(batch.iter().map(|recipient| SingleSend {
                        success: true,
                        message: format!("Email sent via BCC (batch {batch_number})"),
                        recipient: recipient.clone(),
                        attempts,
                    }));
                }
                Err(e) => {
                    // One failed batch fails every recipient in it.
                    error!(
                        batch = batch_number,
                        size = batch.len(),
                        attempts,
                        error = %e,
                        "BCC batch failed"
                    );
                    results.extend(batch.iter().map(|recipient| SingleSend {
                        success: false,
                        message: format!(
                            "BCC batch {batch_number} failed after {attempts} attempts: {e}"
                        ),
                        recipient: recipient.clone(),
                        attempts,
                    }));
                }
            }
        }

        aggregate(results, DeliveryMethod::Bcc)
    }
}

fn aggregate(results: Vec<SingleSend>, method: DeliveryMethod) -> BulkSend {
    let successful = results.iter().filter(|r| r.success).count();
    let bulk = BulkSend {
        total: results.len(),
        successful,
        failed: results.len() - successful,
        results,
        method,
    };

    info!(
        successful = bulk.successful,
        total = bulk.total,
        rate = bulk.success_rate(),
        method = %bulk.method,
        "Bulk delivery finished"
    );

    bulk
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Error, anyhow};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct RecordedCall {
        to: String,
        bcc: Vec<String>,
    }

    /// Transport double: records every call, fails addresses on a deny list.
    struct RecordingTransport {
        calls: Mutex<Vec<RecordedCall>>,
        failing: Vec<String>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing: Vec::new(),
            }
        }

        fn failing_for(addresses: &[&str]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing: addresses.iter().map(ToString::to_string).collect(),
            }
        }

        fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        fn sender(&self) -> &str {
            "mailer@example.com"
        }

        async fn send(
            &self,
            to: &str,
            bcc: &[String],
            _subject: &str,
            _html: &str,
        ) -> Result<(), Error> {
            self.calls.lock().unwrap().push(RecordedCall {
                to: to.to_string(),
                bcc: bcc.to_vec(),
            });

            let refused = self.failing.iter().any(|f| f == to || bcc.contains(f));
            if refused {
                Err(anyhow!("mailbox unavailable"))
            } else {
                Ok(())
            }
        }
    }

    fn recipients(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("user{i}@example.com")).collect()
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2,
        }
    }

    /// Test: one recipient takes the single-send path
    #[tokio::test]
    async fn one_recipient_is_a_single_send() {
        let mailer = Mailer::new(RecordingTransport::new(), retry(3));

        let outcome = mailer
            .deliver(&recipients(1), "hi", "<p>hi</p>", true, 5)
            .await;

        assert!(matches!(outcome, SendOutcome::Single(ref r) if r.success && r.attempts == 1));
        assert_eq!(
            mailer.transport.calls(),
            vec![RecordedCall {
                to: "user0@example.com".to_string(),
                bcc: Vec::new()
            }]
        );
    }

    /// Test: 15 recipients with BCC and batch size 5 make exactly 3 calls
    #[tokio::test]
    async fn bcc_batches_by_batch_size() {
        let mailer = Mailer::new(RecordingTransport::new(), retry(3));

        let outcome = mailer
            .deliver(&recipients(15), "hi", "<p>hi</p>", true, 5)
            .await;

        let calls = mailer.transport.calls();
        assert_eq!(calls.len(), 3);
        for call in &calls {
            // Visible To is the sender, recipients ride in BCC.
            assert_eq!(call.to, "mailer@example.com");
            assert_eq!(call.bcc.len(), 5);
        }

        let SendOutcome::Bulk(bulk) = outcome else {
            panic!("expected a bulk outcome");
        };
        assert_eq!(bulk.method, DeliveryMethod::Bcc);
        assert_eq!(bulk.successful, 15);
    }

    /// Test: 15 recipients without BCC make 15 individual calls
    #[tokio::test]
    async fn without_bcc_every_recipient_gets_a_call() {
        let mailer = Mailer::new(RecordingTransport::new(), retry(3));

        let outcome = mailer
            .deliver(&recipients(15), "hi", "<p>hi</p>", false, 5)
            .await;

        assert_eq!(mailer.transport.calls().len(), 15);

        let SendOutcome::Bulk(bulk) = outcome else {
            panic!("expected a bulk outcome");
        };
        assert_eq!(bulk.method, DeliveryMethod::Individual);
        assert_eq!(bulk.success_rate(), 100.0);
    }

    /// Test: ten or fewer recipients fall back to individual sends even with
    /// use_bcc set
    #[tokio::test]
    async fn small_bcc_jobs_send_individually() {
        let mailer = Mailer::new(RecordingTransport::new(), retry(3));

        let outcome = mailer
            .deliver(&recipients(10), "hi", "<p>hi</p>", true, 5)
            .await;

        assert_eq!(mailer.transport.calls().len(), 10);
        assert!(matches!(
            outcome,
            SendOutcome::Bulk(ref b) if b.method == DeliveryMethod::Individual
        ));
    }

    /// Test: a persistently failing recipient exhausts the attempt budget and
    /// is reported as a terminal failure
    #[tokio::test]
    async fn failing_recipient_exhausts_attempts() {
        let mailer = Mailer::new(
            RecordingTransport::failing_for(&["user1@example.com"]),
            retry(3),
        );

        let outcome = mailer
            .deliver(&recipients(2), "hi", "<p>hi</p>", false, 5)
            .await;

        // One call for user0, three (retried) for user1.
        assert_eq!(mailer.transport.calls().len(), 4);

        let SendOutcome::Bulk(bulk) = outcome else {
            panic!("expected a bulk outcome");
        };
        assert_eq!(bulk.successful, 1);
        assert_eq!(bulk.failed, 1);

        let failed = bulk.results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.recipient, "user1@example.com");
        assert_eq!(failed.attempts, 3);
    }

    /// Test: a failed BCC batch marks every recipient in that batch failed,
    /// leaving other batches untouched
    #[tokio::test]
    async fn failed_bcc_batch_fails_the_whole_batch() {
        let mailer = Mailer::new(
            RecordingTransport::failing_for(&["user2@example.com"]),
            retry(2),
        );

        let outcome = mailer
            .deliver(&recipients(15), "hi", "<p>hi</p>", true, 5)
            .await;

        let SendOutcome::Bulk(bulk) = outcome else {
            panic!("expected a bulk outcome");
        };
        assert_eq!(bulk.total, 15);
        assert_eq!(bulk.failed, 5);
        assert_eq!(bulk.successful, 10);
        assert!((bulk.success_rate() - 66.6).abs() < 1.0);
    }
}
