//! Notification sinks for terminal run summaries.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{DeployError, Result};
use crate::external::{ExternalError, ExternalResult, NotificationSink, RunSummary};

/// POSTs the run summary as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tierline/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DeployError::Config(format!("webhook client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn publish(&self, summary: &RunSummary) -> ExternalResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(summary)
            .send()
            .await
            .map_err(|e| ExternalError::Transient(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(ExternalError::Transient(format!("webhook returned {}", status)))
        } else {
            Err(ExternalError::Permanent(format!("webhook returned {}", status)))
        }
    }
}

/// Writes the run summary to the log. Always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn publish(&self, summary: &RunSummary) -> ExternalResult<()> {
        tracing::info!(
            event = "notify.run_summary",
            run_id = %summary.run_id,
            environment = %summary.environment,
            outcome = %summary.outcome,
            code = %summary.code,
            version = summary.version.as_deref().unwrap_or("-"),
            reason = %summary.reason,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tierline_state::{RunId, RunOutcome};

    fn summary() -> RunSummary {
        RunSummary {
            run_id: RunId::new(),
            environment: "staging".to_string(),
            trigger: "main_push".to_string(),
            operation: "deploy".to_string(),
            actor: "ci".to_string(),
            version: None,
            outcome: RunOutcome::Deployed,
            code: "deployed".to_string(),
            reason: "2 state-changing stages applied".to_string(),
            stages: Vec::new(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.publish(&summary()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_transient() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        let err = notifier.publish(&summary()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
