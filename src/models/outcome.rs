use std::fmt;

use serde::Serialize;

/// Minimum bulk success rate, in percent, for a job to be acknowledged.
/// The threshold is inclusive.
pub const SUCCESS_RATE_THRESHOLD: f64 = 80.0;

/// How a bulk job's transport calls were made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Individual,
    Bcc,
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Individual => f.write_str("individual"),
            Self::Bcc => f.write_str("bcc"),
        }
    }
}

/// Terminal result of delivery to one recipient.
#[derive(Debug, Clone, Serialize)]
pub struct SingleSend {
    pub success: bool,
    pub message: String,
    pub recipient: String,
    pub attempts: u32,
}

/// Aggregated result of a fanned-out delivery.
#[derive(Debug, Clone, Serialize)]
pub struct BulkSend {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<SingleSend>,
    pub method: DeliveryMethod,
}

impl BulkSend {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Single(SingleSend),
    Bulk(BulkSend),
}

/// The ack/reject decision for one processed message.
#[derive(Debug, Clone)]
pub struct JobVerdict {
    pub success: bool,
    pub requeue: bool,
    pub message: String,
}

impl JobVerdict {
    pub fn failure(message: impl Into<String>, requeue: bool) -> Self {
        Self {
            success: false,
            requeue,
            message: message.into(),
        }
    }
}

impl SendOutcome {
    /// Scores the outcome. A bulk job passes iff its success rate reaches the
    /// threshold; below it the whole job is requeued, successful minority
    /// included.
    pub fn verdict(&self) -> JobVerdict {
        match self {
            Self::Single(result) => JobVerdict {
                success: result.success,
                requeue: !result.success,
                message: result.message.clone(),
            },
            Self::Bulk(bulk) => {
                let rate = bulk.success_rate();
                let success = rate >= SUCCESS_RATE_THRESHOLD;

                JobVerdict {
                    success,
                    requeue: !success,
                    message: format!(
                        "{}/{} emails sent successfully ({rate:.1}%)",
                        bulk.successful, bulk.total
                    ),
                }
            }
        }
    }
}
