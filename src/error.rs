use thiserror::Error;

/// Failure modes of one message-processing attempt. The variant decides
/// whether the broker should redeliver the message.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid job payload: {0}")]
    InvalidJob(String),

    #[error("no recipients resolved")]
    NoRecipients,

    #[error("template {0}.html not found")]
    TemplateNotFound(String),

    #[error("template render failed: {0}")]
    TemplateRender(#[source] tera::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessError {
    /// Whether the message should go back to the queue after this failure.
    /// Malformed jobs and jobs with no recipients can never succeed, so
    /// redelivering them would only loop.
    pub fn requeue(&self) -> bool {
        !matches!(self, Self::InvalidJob(_) | Self::NoRecipients)
    }
}
