use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::ProcessError;

/// One queue message describing an email to render and deliver. Immutable
/// once parsed; a requeue redelivers the original bytes, never a mutated job.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailJob {
    /// Direct recipient addresses. Accepts a list or a single (possibly
    /// comma-separated) string; normalized to trimmed, deduplicated entries.
    #[serde(default, deserialize_with = "deserialize_recipients")]
    pub to: Option<Vec<String>>,

    /// Ids to look up through the recipient API. Requires `endpoint`.
    #[serde(default)]
    pub ids: Option<Vec<RecipientId>>,

    #[serde(default)]
    pub endpoint: Option<String>,

    pub subject: String,

    /// Falls back to the queue name when absent.
    #[serde(default)]
    pub template_name: Option<String>,

    #[serde(default)]
    pub context: Map<String, Value>,

    #[serde(default)]
    pub use_bcc: bool,

    #[serde(default = "default_bcc_batch_size")]
    pub bcc_batch_size: usize,
}

fn default_bcc_batch_size() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecipientId {
    Text(String),
    Number(i64),
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(id) => f.write_str(id),
            Self::Number(id) => write!(f, "{id}"),
        }
    }
}

impl EmailJob {
    /// Deserializes and validates a raw queue payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProcessError> {
        let job: Self = serde_json::from_slice(payload)
            .map_err(|e| ProcessError::InvalidJob(e.to_string()))?;
        job.validate()?;
        Ok(job)
    }

    fn validate(&self) -> Result<(), ProcessError> {
        let has_to = self.to.as_ref().is_some_and(|to| !to.is_empty());
        let has_ids = self.ids.as_ref().is_some_and(|ids| !ids.is_empty());

        if !has_to && !has_ids {
            return Err(ProcessError::InvalidJob(
                "must provide either 'to' (direct emails) or 'ids' (to fetch from the API)"
                    .to_string(),
            ));
        }

        if has_ids && self.endpoint.as_deref().is_none_or(str::is_empty) {
            return Err(ProcessError::InvalidJob(
                "'endpoint' is required when using 'ids'".to_string(),
            ));
        }

        Ok(())
    }
}

fn deserialize_recipients<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTo {
        One(String),
        Many(Vec<String>),
    }

    let raw = Option::<RawTo>::deserialize(deserializer)?;

    Ok(raw.map(|raw| {
        let parts: Vec<String> = match raw {
            RawTo::One(addresses) => addresses
                .split(',')
                .map(|address| address.trim().to_string())
                .collect(),
            RawTo::Many(addresses) => addresses
                .into_iter()
                .map(|address| address.trim().to_string())
                .collect(),
        };

        let mut seen = HashSet::new();
        parts
            .into_iter()
            .filter(|address| !address.is_empty() && seen.insert(address.clone()))
            .collect()
    }))
}
