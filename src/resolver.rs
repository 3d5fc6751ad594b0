use std::collections::HashSet;

use anyhow::{Error, Result, anyhow};
use tracing::{info, warn};

use crate::{clients::api::ApiClient, extractor::EmailExtractor, models::job::EmailJob};

/// Resolves a job to its final recipient list: explicit addresses first in
/// their original order, then API lookups in fetch order, deduplicated by
/// first occurrence.
pub struct RecipientResolver {
    api: ApiClient,
    extractor: EmailExtractor,
}

impl RecipientResolver {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            extractor: EmailExtractor::new(),
        }
    }

    /// A failed lookup only shrinks the recipient set; it never aborts the
    /// job. An empty result is the caller's problem.
    pub async fn resolve(&self, job: &EmailJob) -> Vec<String> {
        let mut recipients = Vec::new();
        let mut seen = HashSet::new();

        for address in job.to.iter().flatten() {
            if seen.insert(address.clone()) {
                recipients.push(address.clone());
            }
        }

        if let (Some(ids), Some(endpoint)) = (&job.ids, &job.endpoint) {
            for id in ids {
                match self.fetch_emails(endpoint, &id.to_string()).await {
                    Ok(found) => {
                        for email in found {
                            if seen.insert(email.clone()) {
                                recipients.push(email);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            endpoint = %endpoint,
                            id = %id,
                            error = %e,
                            "Recipient lookup failed, skipping id"
                        );
                    }
                }
            }

            info!(
                endpoint = %endpoint,
                ids = ids.len(),
                recipients = recipients.len(),
                "Recipient resolution finished"
            );
        }

        recipients
    }

    async fn fetch_emails(&self, endpoint: &str, id: &str) -> Result<Vec<String>, Error> {
        let body = self
            .api
            .get(&format!("{}/{id}", endpoint.trim_matches('/')))
            .await?;

        if body.get("error").is_some_and(|e| !e.is_null()) {
            return Err(anyhow!("lookup returned an error: {}", body["error"]));
        }

        Ok(body
            .get("data")
            .map(|data| self.extractor.find_emails(data))
            .unwrap_or_default())
    }
}
